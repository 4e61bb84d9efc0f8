//! Pointer store: append-only revision histories with change waiters

use crate::history::History;
use crate::pointer::{now_ms, PointerAtSnapshot, PointerMeta, Revision};
use async_trait::async_trait;
use parking_lot::RwLock;
use rand::Rng;
use snap_core::{Error, OwnerId, PointerId, PointerKind, Result, SnapshotId};
use std::collections::HashMap;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Versioned, mutable references to snapshots
#[async_trait]
pub trait PointerStore: Send + Sync {
    /// Create the pointer if needed, record `host` as its writer and
    /// return the head revision (0 when never written)
    async fn acquire(&self, id: &PointerId, host: &str) -> Result<Revision>;

    /// Highest revision; a pointer without revisions is not found
    async fn head(&self, id: &PointerId) -> Result<PointerAtSnapshot>;

    /// One revision; revision 0 resolves to the empty snapshot
    async fn get(&self, id: &PointerId, rev: Revision) -> Result<PointerAtSnapshot>;

    /// Append the next revision and wake waiters
    ///
    /// The empty snapshot is accepted only to clear a pointer that holds
    /// something else.
    async fn set(&self, next: PointerAtSnapshot) -> Result<PointerAtSnapshot>;

    /// Insert a revision at its position if absent (replication/backfill)
    async fn set_existing(&self, existing: PointerAtSnapshot) -> Result<()>;

    /// Wait until the head moves past `last_rev`
    async fn wait(
        &self,
        id: &PointerId,
        last_rev: Revision,
        cancel: &CancellationToken,
    ) -> Result<PointerAtSnapshot>;

    /// Write a frozen revision with the head's snapshot
    async fn freeze(&self, id: &PointerId) -> Result<PointerAtSnapshot>;

    /// Reserve a fresh pointer whose revision 1 is the empty snapshot
    async fn temp_pointer(&self, owner: OwnerId, prefix: &str) -> Result<PointerId>;

    /// Revisions so far, newest first
    async fn history(&self, id: &PointerId) -> Result<History>;

    async fn meta(&self, id: &PointerId) -> Result<PointerMeta>;
}

#[derive(Default)]
struct PointerState {
    revisions: Vec<PointerAtSnapshot>,
    meta: PointerMeta,
    waiters: Vec<oneshot::Sender<()>>,
}

impl PointerState {
    fn head(&self) -> Option<&PointerAtSnapshot> {
        self.revisions.last()
    }

    fn head_rev(&self) -> Revision {
        self.head().map_or(0, |h| h.rev)
    }

    fn notify(&mut self) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    /// Nothing but abandoned waiters: the entry can go
    fn is_vacant(&self) -> bool {
        self.revisions.is_empty()
            && self.meta == PointerMeta::default()
            && self.waiters.iter().all(|w| w.is_closed())
    }
}

/// In-memory pointer store guarded by one read/write lock
#[derive(Default)]
pub struct MemoryPointerStore {
    pointers: RwLock<HashMap<PointerId, PointerState>>,
}

impl MemoryPointerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop closed waiters of `id`, and the entry itself if only they held it
    fn forget_waiters(&self, id: &PointerId) {
        let mut pointers = self.pointers.write();
        if let Some(state) = pointers.get_mut(id) {
            state.waiters.retain(|w| !w.is_closed());
            if state.is_vacant() {
                pointers.remove(id);
            }
        }
    }

    /// Validate `next` against the current head and append it
    fn append(state: &mut PointerState, mut next: PointerAtSnapshot) -> Result<PointerAtSnapshot> {
        let pointer = next.pointer.to_string();
        let stale = |reason: String| Error::StaleWrite {
            pointer: pointer.clone(),
            reason,
        };

        if let Some(head) = state.head() {
            if head.frozen {
                return Err(Error::FrozenWrite(pointer.clone()));
            }
        }
        let head_rev = state.head_rev();
        if next.rev != head_rev + 1 {
            return Err(stale(format!("revision {} does not follow head {}", next.rev, head_rev)));
        }

        let head_updated = state.head().map_or(0, |h| h.updated_at);
        if next.updated_at == 0 {
            next.updated_at = now_ms().max(head_updated + 1);
        } else if next.updated_at <= head_updated {
            return Err(stale(format!(
                "updated_at {} is not after head's {}",
                next.updated_at, head_updated
            )));
        }

        state.revisions.push(next.clone());
        state.notify();
        Ok(next)
    }
}

#[async_trait]
impl PointerStore for MemoryPointerStore {
    async fn acquire(&self, id: &PointerId, host: &str) -> Result<Revision> {
        let mut pointers = self.pointers.write();
        let state = pointers.entry(id.clone()).or_default();
        state.meta.write_host = Some(host.to_string());
        debug!(pointer = %id, host, rev = state.head_rev(), "acquired pointer");
        Ok(state.head_rev())
    }

    async fn head(&self, id: &PointerId) -> Result<PointerAtSnapshot> {
        self.pointers
            .read()
            .get(id)
            .and_then(|s| s.head().cloned())
            .ok_or_else(|| Error::not_found(format!("pointer {}", id)))
    }

    async fn get(&self, id: &PointerId, rev: Revision) -> Result<PointerAtSnapshot> {
        if rev == 0 {
            return Ok(PointerAtSnapshot::unwritten(id.clone()));
        }
        let pointers = self.pointers.read();
        let state = pointers
            .get(id)
            .ok_or_else(|| Error::not_found(format!("pointer {}", id)))?;
        state
            .revisions
            .binary_search_by_key(&rev, |p| p.rev)
            .map(|i| state.revisions[i].clone())
            .map_err(|_| Error::not_found(format!("pointer {} revision {}", id, rev)))
    }

    async fn set(&self, next: PointerAtSnapshot) -> Result<PointerAtSnapshot> {
        let mut pointers = self.pointers.write();
        // Unwritten pointers already resolve to the empty snapshot
        let holds_empty = pointers
            .get(&next.pointer)
            .and_then(|s| s.head())
            .map_or(true, |h| h.snapshot.is_empty());
        if next.snapshot.is_empty() && holds_empty {
            return Err(Error::InvalidTarget(format!(
                "pointer {} already holds the empty snapshot",
                next.pointer
            )));
        }
        let state = pointers.entry(next.pointer.clone()).or_default();
        let written = Self::append(state, next)?;
        debug!(pointer = %written.pointer, rev = written.rev, snapshot = %written.snapshot, "set pointer");
        Ok(written)
    }

    async fn set_existing(&self, existing: PointerAtSnapshot) -> Result<()> {
        let mut pointers = self.pointers.write();
        let state = pointers.entry(existing.pointer.clone()).or_default();
        match state.revisions.binary_search_by_key(&existing.rev, |p| p.rev) {
            Ok(i) if state.revisions[i] == existing => Ok(()),
            Ok(_) => Err(Error::StaleWrite {
                pointer: existing.pointer.to_string(),
                reason: format!("revision {} already holds a different value", existing.rev),
            }),
            Err(i) => {
                let at_end = i == state.revisions.len();
                state.revisions.insert(i, existing);
                if at_end {
                    state.notify();
                }
                Ok(())
            }
        }
    }

    async fn wait(
        &self,
        id: &PointerId,
        last_rev: Revision,
        cancel: &CancellationToken,
    ) -> Result<PointerAtSnapshot> {
        loop {
            let mut rx = {
                let mut pointers = self.pointers.write();
                let state = pointers.entry(id.clone()).or_default();
                if let Some(head) = state.head() {
                    if head.rev > last_rev {
                        return Ok(head.clone());
                    }
                }
                state.waiters.retain(|w| !w.is_closed());
                let (tx, rx) = oneshot::channel();
                state.waiters.push(tx);
                rx
            };

            let canceled = tokio::select! {
                _ = cancel.cancelled() => true,
                _ = &mut rx => false,
            };
            drop(rx);
            if canceled {
                self.forget_waiters(id);
                return Err(Error::Canceled);
            }
        }
    }

    async fn freeze(&self, id: &PointerId) -> Result<PointerAtSnapshot> {
        let mut pointers = self.pointers.write();
        let state = pointers
            .get_mut(id)
            .ok_or_else(|| Error::not_found(format!("pointer {}", id)))?;
        let head = state
            .head()
            .cloned()
            .ok_or_else(|| Error::not_found(format!("pointer {}", id)))?;
        let mut frozen = head.next(head.snapshot.clone());
        frozen.frozen = true;
        let written = Self::append(state, frozen)?;
        info!(pointer = %id, rev = written.rev, "froze pointer");
        Ok(written)
    }

    async fn temp_pointer(&self, owner: OwnerId, prefix: &str) -> Result<PointerId> {
        let base = PointerId::normalize_name(prefix);
        let mut rng = rand::thread_rng();
        let mut pointers = self.pointers.write();
        loop {
            let candidate = PointerId::new(
                owner,
                format!("{}_{}", base, rng.gen_range(0..1_000_000_000u32)),
                PointerKind::Workspace,
            )?;
            if pointers.contains_key(&candidate) {
                continue;
            }
            // Revision 1 at the empty snapshot tells "reserved" apart from "never existed"
            let reserved = PointerAtSnapshot {
                updated_at: now_ms(),
                ..PointerAtSnapshot::new(candidate.clone(), 1, SnapshotId::Empty)
            };
            let state = pointers.entry(candidate.clone()).or_default();
            state.revisions.push(reserved);
            debug!(pointer = %candidate, "reserved temp pointer");
            return Ok(candidate);
        }
    }

    async fn history(&self, id: &PointerId) -> Result<History> {
        let pointers = self.pointers.read();
        let state = pointers
            .get(id)
            .ok_or_else(|| Error::not_found(format!("pointer {}", id)))?;
        Ok(History::new(state.revisions.clone().into()))
    }

    async fn meta(&self, id: &PointerId) -> Result<PointerMeta> {
        self.pointers
            .read()
            .get(id)
            .map(|s| s.meta.clone())
            .ok_or_else(|| Error::not_found(format!("pointer {}", id)))
    }
}
