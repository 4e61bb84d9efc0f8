//! The watcher loop
//!
//! One task per watched root. Raw OS events are coalesced, each surviving
//! event is resolved against the disk and diffed against the watcher's view
//! of its head snapshot, and the resulting ops are committed as a linear
//! chain of recipes. Events leave through a channel of capacity 1, so a
//! slow consumer slows the watcher down.
//!
//! FSync writes a cookie file into a private directory that is watched on
//! the same OS subscription; seeing the cookie come back through the
//! pipeline proves every earlier change has been emitted.

use crate::coalesce::{Coalescer, RawEvent};
use crate::limits::check_limits;
use crate::scan::{PathState, Scan, Scanner};
use crate::synth::synthesize;
use notify::{RecommendedWatcher, RecursiveMode, Watcher as _};
use parking_lot::Mutex;
use snap_core::{
    debug::is_debug, path, ApplyMode, Error, FileNode, Op, OwnerId, PathMatcher, Recipe,
    RecipeStore, RecipeTag, Result, SnapshotId, Tree, WatcherConfig,
};
use snap_eval::{MaterializeOptions, Materializer};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tempfile::TempDir;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Raw OS events buffered between the backend thread and the loop
const RAW_CAPACITY: usize = 1024;

/// Supplies the tag each committed batch is recorded under
pub trait TagProvider: Send + Sync {
    fn tag(&self) -> RecipeTag;
}

impl TagProvider for RecipeTag {
    fn tag(&self) -> RecipeTag {
        self.clone()
    }
}

/// One item of the watcher's output stream
#[derive(Debug, Clone)]
pub enum WatchEvent {
    /// `ops` were committed; `snapshot` is the new head
    Ops { snapshot: SnapshotId, ops: Vec<Op> },
    /// Every change made before `fsync(token)` has been emitted
    Sync { token: String },
    /// Terminal failure; nothing follows
    Err(Error),
}

/// What to watch and how to record it
pub struct WatchOptions {
    pub root: PathBuf,
    pub matcher: PathMatcher,
    pub owner: OwnerId,
    /// Snapshot the directory is diffed against at startup
    pub previous: SnapshotId,
    /// Tag for the startup diff
    pub initial_tag: RecipeTag,
    pub tags: Arc<dyn TagProvider>,
    /// Files not modified after this are assumed to match `previous`
    pub min_mtime: Option<SystemTime>,
}

impl WatchOptions {
    pub fn new(root: impl Into<PathBuf>, owner: OwnerId, tags: Arc<dyn TagProvider>) -> Self {
        Self {
            root: root.into(),
            matcher: PathMatcher::all(),
            owner,
            previous: SnapshotId::Empty,
            initial_tag: RecipeTag::Temp,
            tags,
            min_mtime: None,
        }
    }
}

#[derive(Default)]
struct Shared {
    syncs: Mutex<HashMap<String, oneshot::Sender<()>>>,
    paths: Mutex<Vec<(String, oneshot::Sender<SnapshotId>)>>,
    failed: Mutex<Option<Error>>,
}

/// Handle to a running watcher; dropping it stops the loop
pub struct Watcher {
    root: PathBuf,
    cookie_path: PathBuf,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Watcher {
    /// Scan the root, diff it against `opts.previous` and start watching
    pub async fn start(
        materializer: &Materializer,
        config: &WatcherConfig,
        opts: WatchOptions,
        cancel: &CancellationToken,
    ) -> Result<(Watcher, mpsc::Receiver<WatchEvent>)> {
        if config.limit_checks_enabled {
            check_limits()?;
        }
        let root = Scanner::canonical_root(&opts.root)?;
        let scanner = Scanner::new(root.clone(), opts.matcher.clone(), config.max_files_watched)
            .with_min_mtime(opts.min_mtime);

        let cookies = cookie_dir(config)?;
        let cookie_path = Scanner::canonical_root(cookies.path())?;

        let (raw_tx, raw_rx) = mpsc::channel(RAW_CAPACITY);
        let mut os = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
            if raw_tx.blocking_send(event).is_err() {
                debug!("raw event dropped, watcher loop is gone");
            }
        })
        .map_err(notify_error)?;
        os.watch(&cookie_path, RecursiveMode::NonRecursive)
            .map_err(notify_error)?;

        let view = materializer
            .materialize(
                &opts.previous,
                &MaterializeOptions::with_matcher(opts.matcher.clone()),
                cancel,
            )
            .await?;

        let shared = Arc::new(Shared::default());
        let cancel = cancel.child_token();
        let (out, events) = mpsc::channel(1);
        let mut pipeline = Pipeline {
            scanner,
            store: materializer.store().clone(),
            owner: opts.owner,
            tags: opts.tags,
            head: opts.previous,
            view,
            os,
            watched: HashSet::new(),
            cookie_path: cookie_path.clone(),
            _cookies: cookies,
            coalescer: Coalescer::new(config.coalesce_window(), config.max_coalesce),
            shared: shared.clone(),
            out,
            cancel: cancel.clone(),
        };

        // Directories are watched before the state that is diffed is read,
        // rescanning until no new directory shows up
        let (mut scan, mut current) = pipeline.initial_state().await?;
        while pipeline.watch_new(&scan.dirs)? {
            (scan, current) = pipeline.initial_state().await?;
        }
        let initial = {
            let view = pipeline.view.clone();
            blocking(move || Ok(synthesize(&view, "", &current, true))).await?
        };
        info!(
            root = %root.display(),
            files = scan.files.len(),
            dirs = scan.dirs.len(),
            initial_ops = initial.len(),
            "watching"
        );

        let task = tokio::spawn(pipeline.run(raw_rx, initial, opts.initial_tag));
        Ok((
            Watcher {
                root,
                cookie_path,
                shared,
                cancel,
                task: Mutex::new(Some(task)),
            },
            events,
        ))
    }

    /// Canonical root being watched
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write a sync cookie for `token`
    ///
    /// `WatchEvent::Sync { token }` follows every change made before this
    /// call; the returned receiver fires right after it is emitted.
    pub fn fsync(&self, token: &str) -> Result<oneshot::Receiver<()>> {
        if let Some(e) = self.shared.failed.lock().clone() {
            return Err(e);
        }
        if token.is_empty() || token.contains('/') || token == "." || token == ".." {
            return Err(Error::InvalidArgument(format!("invalid sync token {:?}", token)));
        }
        let (tx, rx) = oneshot::channel();
        self.shared.syncs.lock().insert(token.to_string(), tx);
        let cookie = self.cookie_path.join(token);
        if let Err(e) = std::fs::write(&cookie, token.as_bytes()) {
            self.shared.syncs.lock().remove(token);
            return Err(Error::io(cookie, e));
        }
        Ok(rx)
    }

    /// Wait until every change made so far has been emitted
    pub async fn sync(&self) -> Result<()> {
        let token = uuid::Uuid::new_v4().simple().to_string();
        let done = self.fsync(&token)?;
        match done.await {
            Ok(()) => Ok(()),
            Err(_) => Err(self.failure().unwrap_or(Error::Canceled)),
        }
    }

    /// Fires with the head snapshot of the first batch touching `file_path`
    pub fn notify_on(&self, file_path: &str) -> oneshot::Receiver<SnapshotId> {
        let (tx, rx) = oneshot::channel();
        self.shared.paths.lock().push((file_path.to_string(), tx));
        rx
    }

    /// Terminal error the loop stopped with, if any
    pub fn failure(&self) -> Option<Error> {
        self.shared.failed.lock().clone()
    }

    /// Stop the loop and wait for it to exit
    pub async fn stop(&self) -> Result<()> {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.await
                .map_err(|e| Error::Internal(format!("watcher task failed: {}", e)))?;
        }
        match self.failure() {
            Some(e) if !e.is_canceled() => Err(e),
            _ => Ok(()),
        }
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn cookie_dir(config: &WatcherConfig) -> Result<TempDir> {
    let mut builder = tempfile::Builder::new();
    builder.prefix("snap-sync-");
    match &config.cookie_dir {
        Some(parent) => builder.tempdir_in(parent).map_err(|e| Error::io(parent, e)),
        None => builder
            .tempdir()
            .map_err(|e| Error::io(std::env::temp_dir(), e)),
    }
}

fn notify_error(error: notify::Error) -> Error {
    match error.kind {
        notify::ErrorKind::MaxFilesWatch => {
            Error::ResourceExhausted("OS watch limit reached".to_string())
        }
        notify::ErrorKind::Io(io) => Error::io(error.paths.first().cloned().unwrap_or_default(), io),
        other => Error::Internal(format!("watch backend error: {:?}", other)),
    }
}

/// Run filesystem work off the async workers
async fn blocking<T, F>(work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| Error::Internal(format!("scan task failed: {}", e)))?
}

/// Files found at one path and the directories that hold them
#[derive(Debug, Default)]
struct DiskState {
    missing: bool,
    dirs: Vec<String>,
    files: BTreeMap<String, FileNode>,
}

fn read_disk(scanner: &Scanner, rel: &str) -> Result<DiskState> {
    let mut state = DiskState::default();
    match scanner.stat(rel)? {
        PathState::Missing => state.missing = true,
        PathState::Entry(entry) => {
            if let Some(node) = scanner.read(&entry)? {
                state.files.insert(rel.to_string(), node);
            }
        }
        PathState::Dir => {
            let scan = scanner.scan(rel)?;
            for (file_path, entry) in &scan.files {
                if let Some(node) = scanner.read(entry)? {
                    state.files.insert(file_path.clone(), node);
                }
            }
            state.dirs = scan.dirs;
        }
    }
    Ok(state)
}

/// Scan the root and read every file that may differ from `view`
fn initial_state(scanner: &Scanner, view: &Tree) -> Result<(Scan, BTreeMap<String, FileNode>)> {
    let scan = scanner.scan("")?;
    let mut current = BTreeMap::new();
    for (rel, entry) in &scan.files {
        if entry.stale {
            if let Some(known) = view.get_file(rel) {
                current.insert(rel.clone(), known.clone());
                continue;
            }
        }
        if let Some(node) = scanner.read(entry)? {
            current.insert(rel.clone(), node);
        }
    }
    Ok((scan, current))
}

struct Pipeline {
    scanner: Scanner,
    store: Arc<dyn RecipeStore>,
    owner: OwnerId,
    tags: Arc<dyn TagProvider>,
    head: SnapshotId,
    /// Materialized `head`
    view: Tree,
    os: RecommendedWatcher,
    watched: HashSet<String>,
    cookie_path: PathBuf,
    _cookies: TempDir,
    coalescer: Coalescer,
    shared: Arc<Shared>,
    out: mpsc::Sender<WatchEvent>,
    cancel: CancellationToken,
}

impl Pipeline {
    async fn run(
        mut self,
        raw: mpsc::Receiver<notify::Result<notify::Event>>,
        initial: Vec<Op>,
        initial_tag: RecipeTag,
    ) {
        let result = self.drive(raw, initial, initial_tag).await;
        match result {
            Ok(()) => {
                debug!(root = %self.scanner.root().display(), "watcher stopped");
                *self.shared.failed.lock() = Some(Error::Canceled);
            }
            Err(e) if e.is_canceled() => {
                *self.shared.failed.lock() = Some(e);
            }
            Err(e) => {
                warn!(root = %self.scanner.root().display(), error = %e, "watcher failed");
                *self.shared.failed.lock() = Some(e.clone());
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = self.out.send(WatchEvent::Err(e)) => {}
                }
            }
        }
        self.shared.syncs.lock().clear();
        self.shared.paths.lock().clear();
    }

    async fn drive(
        &mut self,
        mut raw: mpsc::Receiver<notify::Result<notify::Event>>,
        initial: Vec<Op>,
        initial_tag: RecipeTag,
    ) -> Result<()> {
        if !initial.is_empty() {
            self.commit(initial, initial_tag).await?;
        }
        loop {
            let deadline = self.coalescer.deadline();
            let ready: Vec<RawEvent> = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(()),
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.coalescer.flush().into_iter().collect()
                }
                event = raw.recv() => match event {
                    Some(Ok(event)) => {
                        if is_debug() {
                            debug!(?event, "raw event");
                        }
                        let now = Instant::now();
                        RawEvent::from_notify(event)
                            .into_iter()
                            .filter_map(|e| self.coalescer.push(e, now))
                            .collect()
                    }
                    Some(Err(e)) => return Err(notify_error(e)),
                    None => return Err(Error::Internal("watch backend stopped".to_string())),
                },
            };
            for event in ready {
                self.process(event).await?;
            }
        }
    }

    async fn process(&mut self, event: RawEvent) -> Result<()> {
        if event.path.parent() == Some(self.cookie_path.as_path()) {
            if let Some(token) = event.path.file_name().and_then(|n| n.to_str()) {
                self.sync(token).await?;
            }
            return Ok(());
        }
        let rel = match self.scanner.rel_path(&event.path) {
            Some(rel) if !rel.is_empty() => rel,
            _ => return Ok(()),
        };
        let ops = self.ops_for(&rel).await?;
        if ops.is_empty() {
            return Ok(());
        }
        let tag = self.tags.tag();
        self.commit(ops, tag).await
    }

    /// Scan the whole root, reusing the view for stale files
    async fn initial_state(&self) -> Result<(Scan, BTreeMap<String, FileNode>)> {
        let scanner = self.scanner.clone();
        let view = self.view.clone();
        blocking(move || initial_state(&scanner, &view)).await
    }

    async fn read_disk(&self, rel: &str) -> Result<DiskState> {
        let scanner = self.scanner.clone();
        let rel = rel.to_string();
        blocking(move || read_disk(&scanner, &rel)).await
    }

    /// Ops bringing the view of `rel` in line with the disk
    async fn ops_for(&mut self, rel: &str) -> Result<Vec<Op>> {
        let mut disk = self.read_disk(rel).await?;
        if disk.missing {
            self.watched.retain(|d| !path::is_within(d, rel));
        }
        // Pick up whatever landed before the new watches existed
        while self.watch_new(&disk.dirs)? {
            disk = self.read_disk(rel).await?;
        }
        let view = self.view.clone();
        let rel = rel.to_string();
        blocking(move || Ok(synthesize(&view, &rel, &disk.files, true))).await
    }

    /// Watch every directory not watched yet; true if any was added
    fn watch_new(&mut self, dirs: &[String]) -> Result<bool> {
        let mut added = false;
        for dir in dirs {
            if self.watched.contains(dir) {
                continue;
            }
            let abs = self.scanner.abs_path(dir);
            match self.os.watch(&abs, RecursiveMode::NonRecursive) {
                Ok(()) => {}
                Err(e) if matches!(e.kind, notify::ErrorKind::PathNotFound) => continue,
                Err(e) => {
                    let e = notify_error(e);
                    if e.is_io_not_found() {
                        continue;
                    }
                    return Err(e);
                }
            }
            self.watched.insert(dir.clone());
            added = true;
        }
        Ok(added)
    }

    async fn commit(&mut self, ops: Vec<Op>, tag: RecipeTag) -> Result<()> {
        for op in &ops {
            let recipe = Recipe::on(op.clone(), self.head.clone());
            let (id, _) = self.store.create(recipe, Some(self.owner), tag.clone()).await?;
            self.view.apply_linear(op, ApplyMode::default())?;
            self.head = id;
        }
        debug!(head = %self.head, ops = ops.len(), tag = %tag, "committed batch");
        self.notify_paths(&ops);
        self.emit(WatchEvent::Ops {
            snapshot: self.head.clone(),
            ops,
        })
        .await
    }

    fn notify_paths(&self, ops: &[Op]) {
        let mut waiters = self.shared.paths.lock();
        if waiters.is_empty() {
            return;
        }
        let touched: Vec<&str> = ops.iter().filter_map(Op::path).collect();
        let mut i = 0;
        while i < waiters.len() {
            let hit = touched
                .iter()
                .any(|t| path::is_within(&waiters[i].0, t) || path::is_within(t, &waiters[i].0));
            if hit {
                let (_, tx) = waiters.swap_remove(i);
                let _ = tx.send(self.head.clone());
            } else {
                i += 1;
            }
        }
    }

    async fn sync(&mut self, token: &str) -> Result<()> {
        let waiter = self.shared.syncs.lock().remove(token);
        let Some(waiter) = waiter else {
            return Ok(());
        };
        if let Err(e) = std::fs::remove_file(self.cookie_path.join(token)) {
            debug!(token, error = %e, "could not remove sync cookie");
        }
        self.emit(WatchEvent::Sync {
            token: token.to_string(),
        })
        .await?;
        let _ = waiter.send(());
        Ok(())
    }

    async fn emit(&self, event: WatchEvent) -> Result<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Canceled),
            sent = self.out.send(event) => sent.map_err(|_| Error::Canceled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snap_core::MemoryRecipeStore;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::time::timeout;

    const OWNER: OwnerId = OwnerId(3);

    fn config() -> WatcherConfig {
        WatcherConfig {
            limit_checks_enabled: false,
            ..WatcherConfig::default()
        }
    }

    fn materializer() -> Materializer {
        Materializer::new(Arc::new(MemoryRecipeStore::new()))
    }

    async fn start(
        mat: &Materializer,
        dir: &TempDir,
        previous: SnapshotId,
    ) -> (Watcher, mpsc::Receiver<WatchEvent>) {
        let mut opts = WatchOptions::new(dir.path(), OWNER, Arc::new(RecipeTag::Temp));
        opts.previous = previous;
        Watcher::start(mat, &config(), opts, &CancellationToken::new())
            .await
            .unwrap()
    }

    /// Everything emitted up to and including `Sync { token }`
    async fn until_sync(events: &mut mpsc::Receiver<WatchEvent>, token: &str) -> Vec<WatchEvent> {
        let mut seen = Vec::new();
        loop {
            let event = timeout(Duration::from_secs(10), events.recv())
                .await
                .expect("timed out waiting for sync")
                .expect("watcher closed");
            let done = matches!(&event, WatchEvent::Sync { token: t } if t == token);
            seen.push(event);
            if done {
                return seen;
            }
        }
    }

    fn last_snapshot(events: &[WatchEvent]) -> Option<SnapshotId> {
        events.iter().rev().find_map(|e| match e {
            WatchEvent::Ops { snapshot, .. } => Some(snapshot.clone()),
            _ => None,
        })
    }

    async fn files(mat: &Materializer, id: &SnapshotId) -> BTreeMap<String, String> {
        let tree = mat.materialize_all(id, &CancellationToken::new()).await.unwrap();
        tree.files()
            .into_iter()
            .map(|(p, f)| (p, String::from_utf8(f.data.to_vec()).unwrap()))
            .collect()
    }

    #[tokio::test]
    async fn test_empty_dir_emits_only_sync() {
        let dir = TempDir::new().unwrap();
        let mat = materializer();
        let (watcher, mut events) = start(&mat, &dir, SnapshotId::Empty).await;
        let _done = watcher.fsync("first").unwrap();
        let seen = until_sync(&mut events, "first").await;
        assert_eq!(seen.len(), 1);
        watcher.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_write_then_fsync_orders_ops_first() {
        let dir = TempDir::new().unwrap();
        let mat = materializer();
        let (watcher, mut events) = start(&mat, &dir, SnapshotId::Empty).await;
        let _ = watcher.fsync("ready").unwrap();
        until_sync(&mut events, "ready").await;

        fs::write(dir.path().join("test.tmp"), "hello").unwrap();
        let done = watcher.fsync("t").unwrap();
        let seen = until_sync(&mut events, "t").await;
        done.await.unwrap();

        let first_op = seen.iter().find_map(|e| match e {
            WatchEvent::Ops { ops, .. } => ops.first().cloned(),
            _ => None,
        });
        assert!(matches!(first_op, Some(Op::WriteFile { ref path, .. }) if path == "test.tmp"));
        let head = last_snapshot(&seen).unwrap();
        assert_eq!(files(&mat, &head).await["test.tmp"], "hello");
    }

    #[tokio::test]
    async fn test_initial_diff_against_previous() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a"), "1").unwrap();
        fs::write(dir.path().join("c"), "3").unwrap();

        let mat = materializer();
        let store = mat.store().clone();
        let (x, _) = store
            .create(Recipe::leaf(Op::write("a", "1")), Some(OWNER), RecipeTag::Temp)
            .await
            .unwrap();
        let (previous, _) = store
            .create(Recipe::on(Op::write("b", "2"), x), Some(OWNER), RecipeTag::Temp)
            .await
            .unwrap();

        let (watcher, mut events) = start(&mat, &dir, previous).await;
        let _ = watcher.fsync("s").unwrap();
        let seen = until_sync(&mut events, "s").await;
        let WatchEvent::Ops { snapshot, ops } = &seen[0] else {
            panic!("expected the startup diff first, got {:?}", seen[0]);
        };
        assert_eq!(ops, &vec![Op::remove("b"), Op::write("c", "3")]);
        let expected: BTreeMap<String, String> =
            [("a".to_string(), "1".to_string()), ("c".to_string(), "3".to_string())].into();
        assert_eq!(files(&mat, snapshot).await, expected);
    }

    #[tokio::test]
    async fn test_directory_create_and_remove() {
        let dir = TempDir::new().unwrap();
        let mat = materializer();
        let (watcher, mut events) = start(&mat, &dir, SnapshotId::Empty).await;

        fs::create_dir_all(dir.path().join("sub/deeper")).unwrap();
        fs::write(dir.path().join("sub/deeper/x.txt"), "x").unwrap();
        let _ = watcher.fsync("made").unwrap();
        let seen = until_sync(&mut events, "made").await;
        let head = last_snapshot(&seen).unwrap();
        assert_eq!(files(&mat, &head).await["sub/deeper/x.txt"], "x");

        fs::remove_dir_all(dir.path().join("sub")).unwrap();
        let _ = watcher.fsync("gone").unwrap();
        let seen = until_sync(&mut events, "gone").await;
        let head = last_snapshot(&seen).unwrap();
        assert!(files(&mat, &head).await.is_empty());
    }

    #[tokio::test]
    async fn test_existing_dirs_watched_from_start() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("a/b/c")).unwrap();
        fs::write(dir.path().join("a/b/c/old.txt"), "old").unwrap();
        let mat = materializer();
        let (watcher, mut events) = start(&mat, &dir, SnapshotId::Empty).await;

        // No sync in between: the write lands right after start returns
        fs::write(dir.path().join("a/b/c/new.txt"), "new").unwrap();
        fs::create_dir(dir.path().join("a/b/c/d")).unwrap();
        fs::write(dir.path().join("a/b/c/d/deep.txt"), "deep").unwrap();
        let _ = watcher.fsync("s").unwrap();
        let seen = until_sync(&mut events, "s").await;

        let head = last_snapshot(&seen).unwrap();
        let expected: BTreeMap<String, String> = [
            ("a/b/c/d/deep.txt", "deep"),
            ("a/b/c/new.txt", "new"),
            ("a/b/c/old.txt", "old"),
        ]
        .into_iter()
        .map(|(p, d)| (p.to_string(), d.to_string()))
        .collect();
        assert_eq!(files(&mat, &head).await, expected);
        watcher.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_notify_on_path() {
        let dir = TempDir::new().unwrap();
        let mat = materializer();
        let (watcher, mut events) = start(&mat, &dir, SnapshotId::Empty).await;
        let touched = watcher.notify_on("watched.txt");

        fs::write(dir.path().join("other.txt"), "o").unwrap();
        fs::write(dir.path().join("watched.txt"), "w").unwrap();
        let _ = watcher.fsync("s").unwrap();
        let seen = until_sync(&mut events, "s").await;

        let at = timeout(Duration::from_secs(5), touched).await.unwrap().unwrap();
        assert_eq!(files(&mat, &at).await.get("watched.txt").map(String::as_str), Some("w"));
        assert!(last_snapshot(&seen).is_some());
    }

    #[tokio::test]
    async fn test_min_mtime_trusts_previous() {
        use filetime::{set_file_mtime, FileTime};

        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a"), "on disk").unwrap();
        let old = SystemTime::now() - Duration::from_secs(600);
        set_file_mtime(dir.path().join("a"), FileTime::from_system_time(old)).unwrap();

        let mat = materializer();
        let (previous, _) = mat
            .store()
            .create(Recipe::leaf(Op::write("a", "recorded")), Some(OWNER), RecipeTag::Temp)
            .await
            .unwrap();
        let mut opts = WatchOptions::new(dir.path(), OWNER, Arc::new(RecipeTag::Temp));
        opts.previous = previous;
        opts.min_mtime = Some(SystemTime::now() - Duration::from_secs(60));
        let (watcher, mut events) = Watcher::start(&mat, &config(), opts, &CancellationToken::new())
            .await
            .unwrap();
        let _ = watcher.fsync("s").unwrap();
        let seen = until_sync(&mut events, "s").await;
        assert_eq!(seen.len(), 1, "stale file should not be rediffed: {:?}", seen);
    }

    #[tokio::test]
    async fn test_invalid_token_and_stop() {
        let dir = TempDir::new().unwrap();
        let mat = materializer();
        let (watcher, _events) = start(&mat, &dir, SnapshotId::Empty).await;
        assert!(matches!(watcher.fsync("a/b"), Err(Error::InvalidArgument(_))));
        watcher.stop().await.unwrap();
        assert!(watcher.sync().await.is_err());
    }
}
