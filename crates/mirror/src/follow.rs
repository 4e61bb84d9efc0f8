//! Checkout mirrors: directories that follow a pointer
//!
//! Each pointer update is replayed onto the directory as the file ops that
//! lead from the snapshot on disk to the new one. When no such linear path
//! exists the directory is cleared and checked out again.

use crate::apply::FsApplier;
use crate::checkout::{check_tree, write_tree};
use crate::db::Db;
use parking_lot::Mutex;
use snap_core::{Error, PointerId, RecipeTag, Result, SnapshotId};
use snap_eval::recipes_between;
use snap_journal::{PointerAtSnapshot, Revision};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Longest op chain replayed incrementally
const MAX_INCREMENTAL_OPS: usize = 1000;

struct Follower {
    pointer: PointerId,
    cancel: CancellationToken,
    task: JoinHandle<Result<()>>,
}

/// Registry of checkout mirrors keyed by directory
pub struct CheckoutMirrors {
    db: Db,
    active: Mutex<HashMap<PathBuf, Follower>>,
}

impl CheckoutMirrors {
    pub fn new(db: Db) -> Self {
        Self {
            db,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Check out the head of `pointer` into `root` and keep it current
    ///
    /// Whatever `root` held before is removed.
    #[instrument(skip(self, root), fields(root = %root.display()))]
    pub async fn start(&self, pointer: &PointerId, root: &Path) -> Result<()> {
        if !root.is_absolute() {
            return Err(Error::InvalidArgument(format!(
                "checkout mirror root {} is not absolute",
                root.display()
            )));
        }
        if !root.is_dir() {
            return Err(Error::not_found(format!("directory {}", root.display())));
        }
        if self.active.lock().contains_key(root) {
            return Err(Error::InvalidArgument(format!(
                "{} already follows a pointer",
                root.display()
            )));
        }

        let head = match self.db.pointers().head(pointer).await {
            Ok(head) => head,
            Err(e) if e.is_not_found() => PointerAtSnapshot::unwritten(pointer.clone()),
            Err(e) => return Err(e),
        };
        let cancel = CancellationToken::new();
        let applier = FsApplier::new(root);
        refresh(&self.db, &applier, &head.snapshot, &cancel).await?;

        let follow = Follow {
            db: self.db.clone(),
            pointer: pointer.clone(),
            applier,
            snapshot: head.snapshot,
            rev: head.rev,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(follow.run());
        info!(pointer = %pointer, rev = head.rev, "following pointer");
        self.active.lock().insert(
            root.to_path_buf(),
            Follower {
                pointer: pointer.clone(),
                cancel,
                task,
            },
        );
        Ok(())
    }

    /// Stop following; returns the error the loop failed with, if any
    pub async fn stop(&self, root: &Path) -> Result<()> {
        let follower = self
            .active
            .lock()
            .remove(root)
            .ok_or_else(|| Error::not_found(format!("checkout mirror at {}", root.display())))?;
        follower.cancel.cancel();
        let result = follower
            .task
            .await
            .map_err(|e| Error::Internal(format!("checkout mirror task failed: {}", e)))?;
        match result {
            Err(e) if !e.is_canceled() => Err(e),
            _ => {
                debug!(pointer = %follower.pointer, "checkout mirror stopped");
                Ok(())
            }
        }
    }

    /// Directories currently following a pointer
    pub fn active(&self) -> Vec<(PathBuf, PointerId)> {
        let mut all: Vec<(PathBuf, PointerId)> = self
            .active
            .lock()
            .iter()
            .map(|(root, f)| (root.clone(), f.pointer.clone()))
            .collect();
        all.sort();
        all
    }

    pub async fn shutdown(&self) {
        let roots: Vec<PathBuf> = self.active.lock().keys().cloned().collect();
        for root in roots {
            if let Err(e) = self.stop(&root).await {
                warn!(root = %root.display(), error = %e, "checkout mirror stopped with error");
            }
        }
    }
}

struct Follow {
    db: Db,
    pointer: PointerId,
    applier: FsApplier,
    snapshot: SnapshotId,
    rev: Revision,
    cancel: CancellationToken,
}

impl Follow {
    async fn run(mut self) -> Result<()> {
        let result = self.drive().await;
        if let Err(e) = &result {
            if !e.is_canceled() {
                warn!(pointer = %self.pointer, error = %e, "checkout mirror failed");
            }
        }
        result
    }

    async fn drive(&mut self) -> Result<()> {
        loop {
            let next = self
                .db
                .pointers()
                .wait(&self.pointer, self.rev, &self.cancel)
                .await?;
            self.rev = next.rev;
            if next.snapshot == self.snapshot {
                continue;
            }

            let tag = RecipeTag::Edit(self.pointer.clone());
            let ops = recipes_between(
                self.db.store().as_ref(),
                &self.snapshot,
                &next.snapshot,
                &tag,
                MAX_INCREMENTAL_OPS,
            )
            .await?;
            match ops {
                Some(ops) => {
                    let applier = self.applier.clone();
                    let count = ops.len();
                    tokio::task::spawn_blocking(move || applier.apply_all(&ops))
                        .await
                        .map_err(|e| Error::Internal(format!("apply task failed: {}", e)))??;
                    debug!(rev = next.rev, ops = count, "replayed ops");
                }
                None => {
                    debug!(rev = next.rev, "no linear path, checking out again");
                    refresh(&self.db, &self.applier, &next.snapshot, &self.cancel).await?;
                }
            }
            self.snapshot = next.snapshot;
        }
    }
}

/// Replace the contents of the applier's root with `snapshot`
async fn refresh(
    db: &Db,
    applier: &FsApplier,
    snapshot: &SnapshotId,
    cancel: &CancellationToken,
) -> Result<()> {
    let tree = db.materializer().materialize_all(snapshot, cancel).await?;
    check_tree(&tree)?;
    let clearing = applier.clone();
    tokio::task::spawn_blocking(move || clearing.clear())
        .await
        .map_err(|e| Error::Internal(format!("clear task failed: {}", e)))??;
    write_tree(applier.root(), snapshot, tree).await?;
    Ok(())
}
