//! Lazy iteration over a pointer's revision history

use crate::pointer::{PointerAtSnapshot, Revision};
use snap_core::SnapshotId;
use std::sync::Arc;

/// Point-in-time view of a pointer's revisions, iterated newest first
#[derive(Debug, Clone)]
pub struct History {
    revisions: Arc<[PointerAtSnapshot]>,
    /// One past the next revision to yield
    end: usize,
}

impl History {
    pub(crate) fn new(revisions: Arc<[PointerAtSnapshot]>) -> Self {
        let end = revisions.len();
        Self { revisions, end }
    }

    /// Stop before reaching revision `rev` (exclusive)
    pub fn since(self, rev: Revision) -> impl Iterator<Item = PointerAtSnapshot> {
        self.take_while(move |p| p.rev > rev)
    }

    /// Only the snapshot IDs, newest first
    pub fn snapshots(self) -> impl Iterator<Item = SnapshotId> {
        self.map(|p| p.snapshot)
    }
}

impl Iterator for History {
    type Item = PointerAtSnapshot;

    fn next(&mut self) -> Option<Self::Item> {
        if self.end == 0 {
            return None;
        }
        self.end -= 1;
        Some(self.revisions[self.end].clone())
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.end, Some(self.end))
    }
}

impl ExactSizeIterator for History {}
