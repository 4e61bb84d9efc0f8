//! Mirrors: live directories bound to pointers
//!
//! A mirror runs a watcher over its directory and advances its pointer to
//! every snapshot the watcher commits. The pointer is not moved until the
//! first sync event, so it never points at a partially ingested tree.

use crate::db::Db;
use crate::heatmap::Heatmap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use snap_core::{Error, Op, PathMatcher, PointerId, RecipeTag, Result, SnapshotId};
use snap_journal::PointerAtSnapshot;
use snap_watcher::{snapshot_dir, WatchEvent, WatchOptions, Watcher};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Directory, pointer and matcher of a mirror
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorSpec {
    pub pointer: PointerId,
    pub root: PathBuf,
    pub matcher: PathMatcher,
}

impl MirrorSpec {
    pub fn new(pointer: PointerId, root: impl Into<PathBuf>) -> Self {
        Self {
            pointer,
            root: root.into(),
            matcher: PathMatcher::all(),
        }
    }

    pub fn with_matcher(mut self, matcher: PathMatcher) -> Self {
        self.matcher = matcher;
        self
    }
}

/// Point-in-time view of one mirror
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorStatus {
    pub pointer: PointerId,
    pub root: PathBuf,
    pub matcher: PathMatcher,
    pub head: PointerAtSnapshot,
    /// Latest snapshot committed by the watcher
    pub snapshot: SnapshotId,
    pub seen_first_sync: bool,
    /// Set once the mirror loop has stopped with an error
    pub error: Option<String>,
}

/// Head of a pointer and whether something mirrors into it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointerStatus {
    pub head: PointerAtSnapshot,
    pub mirrored: bool,
}

type SyncWaiter = oneshot::Sender<Result<PointerAtSnapshot>>;

struct MirrorState {
    head: PointerAtSnapshot,
    current: SnapshotId,
    seen_first_sync: bool,
    heatmap: Heatmap,
    waiters: HashMap<String, SyncWaiter>,
    failed: Option<Error>,
}

/// What the mirror loop needs
struct Core {
    db: Db,
    pointer: PointerId,
    state: Mutex<MirrorState>,
    cancel: CancellationToken,
}

/// One running mirror
pub struct Mirror {
    spec: MirrorSpec,
    watcher: Watcher,
    core: Arc<Core>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Mirror {
    /// Acquire the pointer and start watching `spec.root`
    #[instrument(skip(db, spec), fields(pointer = %spec.pointer, root = %spec.root.display()))]
    pub async fn start(db: &Db, spec: MirrorSpec) -> Result<Mirror> {
        if !spec.root.is_absolute() {
            return Err(Error::InvalidArgument(format!(
                "mirror root {} is not absolute",
                spec.root.display()
            )));
        }
        let pointers = db.pointers();
        let rev = pointers.acquire(&spec.pointer, db.host()).await?;
        let head = pointers.get(&spec.pointer, rev).await?;

        let config = db.config();
        if rev > 0 && config.mirror.preemptive_optimize {
            // Warm the store with the directory's content before diffing
            let warmed = snapshot_dir(
                db.store().clone(),
                &spec.root,
                &spec.matcher,
                db.owner(),
                &config.watcher,
            )
            .await?;
            debug!(snapshot = %warmed, "pre-optimized directory");
        }

        let mut opts = WatchOptions::new(
            spec.root.clone(),
            db.owner(),
            Arc::new(RecipeTag::Edit(spec.pointer.clone())),
        );
        opts.matcher = spec.matcher.clone();
        opts.previous = head.snapshot.clone();
        opts.initial_tag = RecipeTag::Temp;

        let cancel = CancellationToken::new();
        let (watcher, events) = Watcher::start(db.materializer(), &config.watcher, opts, &cancel).await?;

        let core = Arc::new(Core {
            db: db.clone(),
            pointer: spec.pointer.clone(),
            state: Mutex::new(MirrorState {
                current: head.snapshot.clone(),
                head,
                seen_first_sync: false,
                heatmap: Heatmap::new(config.mirror.write_window(), config.mirror.mirror_write_limit),
                waiters: HashMap::new(),
                failed: None,
            }),
            cancel,
        });
        let task = tokio::spawn(core.clone().run(events));

        // The first sync marks the end of the initial rescan
        let token = format!("start-{}", uuid::Uuid::new_v4().simple());
        watcher.fsync(&token)?;

        info!(rev, "mirror started");
        Ok(Mirror {
            spec,
            watcher,
            core,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn spec(&self) -> &MirrorSpec {
        &self.spec
    }

    /// Wait until every change made so far is reflected in the pointer
    pub async fn fsync(&self, token: &str) -> Result<PointerAtSnapshot> {
        let rx = {
            let mut state = self.core.state.lock();
            if let Some(e) = &state.failed {
                return Err(e.clone());
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.insert(token.to_string(), tx);
            rx
        };
        if let Err(e) = self.watcher.fsync(token) {
            self.core.state.lock().waiters.remove(token);
            return Err(e);
        }
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(self.failure().unwrap_or(Error::Canceled)),
        }
    }

    /// `fsync` under a fresh token
    pub async fn sync(&self) -> Result<PointerAtSnapshot> {
        let token = uuid::Uuid::new_v4().simple().to_string();
        self.fsync(&token).await
    }

    pub fn failure(&self) -> Option<Error> {
        self.core.state.lock().failed.clone()
    }

    pub fn status(&self) -> MirrorStatus {
        let state = self.core.state.lock();
        MirrorStatus {
            pointer: self.spec.pointer.clone(),
            root: self.spec.root.clone(),
            matcher: self.spec.matcher.clone(),
            head: state.head.clone(),
            snapshot: state.current.clone(),
            seen_first_sync: state.seen_first_sync,
            error: state
                .failed
                .as_ref()
                .filter(|e| !e.is_canceled())
                .map(|e| e.to_string()),
        }
    }

    /// Stop watching and wait for the loop; returns the error it failed with
    pub async fn stop(&self) -> Result<()> {
        self.core.cancel.cancel();
        let watched = self.watcher.stop().await;
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.await
                .map_err(|e| Error::Internal(format!("mirror task failed: {}", e)))?;
        }
        if let Some(e) = self.failure().filter(|e| !e.is_canceled()) {
            return Err(e);
        }
        watched?;
        info!(pointer = %self.spec.pointer, "mirror stopped");
        Ok(())
    }
}

impl Drop for Mirror {
    fn drop(&mut self) {
        self.core.cancel.cancel();
    }
}

impl Core {
    async fn run(self: Arc<Self>, events: mpsc::Receiver<WatchEvent>) {
        let error = match self.drive(events).await {
            Ok(()) => Error::Canceled,
            Err(e) => e,
        };
        if !error.is_canceled() {
            warn!(pointer = %self.pointer, error = %error, "mirror failed");
        }
        {
            let mut state = self.state.lock();
            state.failed = Some(error.clone());
            for (_, waiter) in state.waiters.drain() {
                let _ = waiter.send(Err(error.clone()));
            }
        }
        self.cancel.cancel();
    }

    async fn drive(&self, mut events: mpsc::Receiver<WatchEvent>) -> Result<()> {
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                event = events.recv() => event,
            };
            match event {
                Some(WatchEvent::Ops { snapshot, ops }) => self.on_ops(snapshot, &ops).await?,
                Some(WatchEvent::Sync { token }) => self.on_sync(&token).await?,
                Some(WatchEvent::Err(e)) => return Err(e),
                None => return Ok(()),
            }
        }
    }

    async fn on_ops(&self, snapshot: SnapshotId, ops: &[Op]) -> Result<()> {
        let head = {
            let mut state = self.state.lock();
            state.current = snapshot.clone();
            if !state.seen_first_sync {
                return Ok(());
            }
            state.heatmap.record(ops.iter().filter_map(Op::path), Instant::now())?;
            state.head.clone()
        };
        let written = self.db.pointers().set(head.next(snapshot)).await?;
        debug!(pointer = %self.pointer, rev = written.rev, "advanced pointer");
        self.state.lock().head = written;
        Ok(())
    }

    async fn on_sync(&self, token: &str) -> Result<()> {
        let (first, current, mut head) = {
            let state = self.state.lock();
            (!state.seen_first_sync, state.current.clone(), state.head.clone())
        };
        if first {
            let optimized = self.db.optimizer().optimize(&current, &self.cancel).await?;
            if optimized != head.snapshot {
                head = self.db.pointers().set(head.next(optimized)).await?;
                info!(pointer = %self.pointer, rev = head.rev, snapshot = %head.snapshot, "pointer caught up with directory");
            }
            let mut state = self.state.lock();
            state.head = head.clone();
            state.seen_first_sync = true;
        }
        let waiter = self.state.lock().waiters.remove(token);
        if let Some(waiter) = waiter {
            let _ = waiter.send(Ok(head));
        }
        Ok(())
    }
}

/// Registry of active mirrors keyed by pointer
pub struct Mirrors {
    db: Db,
    active: Mutex<HashMap<PointerId, Arc<Mirror>>>,
}

impl Mirrors {
    pub fn new(db: Db) -> Self {
        Self {
            db,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Start mirroring; a mirror already running with the same spec is kept
    pub async fn start(&self, spec: MirrorSpec) -> Result<MirrorStatus> {
        let existing = self.active.lock().get(&spec.pointer).cloned();
        if let Some(mirror) = existing {
            if mirror.spec == spec && mirror.failure().is_none() {
                debug!(pointer = %spec.pointer, "mirror already running");
                return Ok(mirror.status());
            }
            self.active.lock().remove(&spec.pointer);
            if let Err(e) = mirror.stop().await {
                warn!(pointer = %spec.pointer, error = %e, "replaced mirror had failed");
            }
        }

        let mirror = Arc::new(Mirror::start(&self.db, spec).await?);
        let status = mirror.status();
        self.active.lock().insert(status.pointer.clone(), mirror);
        Ok(status)
    }

    pub fn get(&self, pointer: &PointerId) -> Result<Arc<Mirror>> {
        self.active
            .lock()
            .get(pointer)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("mirror for {}", pointer)))
    }

    pub async fn stop(&self, pointer: &PointerId) -> Result<()> {
        let mirror = self
            .active
            .lock()
            .remove(pointer)
            .ok_or_else(|| Error::not_found(format!("mirror for {}", pointer)))?;
        mirror.stop().await
    }

    pub async fn fsync(&self, pointer: &PointerId, token: &str) -> Result<PointerAtSnapshot> {
        self.get(pointer)?.fsync(token).await
    }

    /// Every active mirror, sorted by pointer
    pub fn status(&self) -> Vec<MirrorStatus> {
        let mut all: Vec<MirrorStatus> = self.active.lock().values().map(|m| m.status()).collect();
        all.sort_by(|a, b| a.pointer.cmp(&b.pointer));
        all
    }

    pub async fn pointer_status(&self, pointer: &PointerId) -> Result<PointerStatus> {
        let head = match self.db.pointers().head(pointer).await {
            Ok(head) => head,
            Err(e) if e.is_not_found() => PointerAtSnapshot::unwritten(pointer.clone()),
            Err(e) => return Err(e),
        };
        let mirrored = self.active.lock().contains_key(pointer);
        Ok(PointerStatus { head, mirrored })
    }

    /// Stop every mirror
    pub async fn shutdown(&self) {
        let all: Vec<Arc<Mirror>> = self.active.lock().drain().map(|(_, m)| m).collect();
        for mirror in all {
            if let Err(e) = mirror.stop().await {
                warn!(pointer = %mirror.spec().pointer, error = %e, "mirror stopped with error");
            }
        }
    }
}
