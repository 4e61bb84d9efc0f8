//! Pointer revision records

use serde::{Deserialize, Serialize};
use snap_core::{PointerId, SnapshotId};
use std::time::{SystemTime, UNIX_EPOCH};

/// Pointer revision number; 0 means "never written"
pub type Revision = u64;

/// One revision of a pointer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointerAtSnapshot {
    pub pointer: PointerId,
    pub rev: Revision,
    pub snapshot: SnapshotId,
    /// Once set, the pointer rejects every later write
    pub frozen: bool,
    /// Unix milliseconds; 0 asks the store to stamp the current time
    pub updated_at: u64,
}

impl PointerAtSnapshot {
    /// A revision to pass to `set`, stamped by the store
    pub fn new(pointer: PointerId, rev: Revision, snapshot: SnapshotId) -> Self {
        Self {
            pointer,
            rev,
            snapshot,
            frozen: false,
            updated_at: 0,
        }
    }

    /// What revision 0 of any pointer resolves to
    pub fn unwritten(pointer: PointerId) -> Self {
        Self::new(pointer, 0, SnapshotId::Empty)
    }

    /// The revision that would follow this one
    pub fn next(&self, snapshot: SnapshotId) -> Self {
        Self::new(self.pointer.clone(), self.rev + 1, snapshot)
    }
}

/// Per-pointer metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointerMeta {
    /// Host currently holding the write lock
    pub write_host: Option<String>,
}

/// Current wall-clock time in Unix milliseconds
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
