//! Checkouts: writing a snapshot into a directory and repairing it later

use crate::apply::{check_symlink, FsApplier};
use crate::db::Db;
use serde::{Deserialize, Serialize};
use snap_core::{path, Error, FileNode, FileType, PathMatcher, Result, SnapshotId, Tree};
use snap_watcher::changed_since;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

/// What a checkout wrote, enough to reset it later
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutStatus {
    pub root: PathBuf,
    pub snapshot: SnapshotId,
    /// Latest modification time of any file the checkout wrote
    pub mtime: SystemTime,
    pub files: usize,
}

/// Materialize `snapshot` into `dest`
///
/// An empty `dest` checks out into a fresh temporary directory that is left
/// in place. Otherwise `dest` must be absolute, exist and be empty.
#[instrument(skip(db, cancel), fields(snapshot = %snapshot))]
pub async fn checkout(
    db: &Db,
    snapshot: &SnapshotId,
    dest: &Path,
    cancel: &CancellationToken,
) -> Result<CheckoutStatus> {
    let root = if dest.as_os_str().is_empty() {
        tempfile::Builder::new()
            .prefix("snap-checkout-")
            .tempdir()
            .map_err(|e| Error::io(std::env::temp_dir(), e))?
            .into_path()
    } else {
        if !dest.is_absolute() {
            return Err(Error::InvalidArgument(format!(
                "checkout path {} is not absolute",
                dest.display()
            )));
        }
        let mut entries = fs::read_dir(dest).map_err(|e| Error::io(dest, e))?;
        if entries.next().is_some() {
            return Err(Error::InvalidArgument(format!(
                "checkout path {} is not empty",
                dest.display()
            )));
        }
        dest.to_path_buf()
    };

    let tree = db.materializer().materialize_all(snapshot, cancel).await?;
    let status = write_tree(&root, snapshot, tree).await?;
    info!(root = %root.display(), files = status.files, "checked out snapshot");
    Ok(status)
}

/// Fail if any symlink of `tree` would escape the checkout root
pub(crate) fn check_tree(tree: &Tree) -> Result<()> {
    for (file_path, node) in tree.files() {
        if node.file_type == FileType::Symlink {
            check_symlink(&file_path, &node.data)?;
        }
    }
    Ok(())
}

/// Write every file of `tree` under `root`, which is assumed empty
pub(crate) async fn write_tree(root: &Path, snapshot: &SnapshotId, tree: Tree) -> Result<CheckoutStatus> {
    check_tree(&tree)?;
    let files: Vec<(String, FileNode)> = tree
        .files()
        .into_iter()
        .map(|(p, f)| (p, f.clone()))
        .collect();

    let applier = FsApplier::new(root);
    let count = files.len();
    let mtime = tokio::task::spawn_blocking(move || -> Result<SystemTime> {
        let mut mtime = SystemTime::UNIX_EPOCH;
        for (file_path, node) in &files {
            applier.write(file_path, node)?;
            mtime = mtime.max(modified(&path::to_os_path(applier.root(), file_path))?);
        }
        Ok(mtime)
    })
    .await
    .map_err(|e| Error::Internal(format!("checkout task failed: {}", e)))??;

    Ok(CheckoutStatus {
        root: root.to_path_buf(),
        snapshot: snapshot.clone(),
        mtime,
        files: count,
    })
}

/// Undo local changes made to a checkout since it was written
///
/// Only paths modified after `status.mtime` are looked at: changed files
/// are rewritten from the snapshot or removed, and files deleted from a
/// changed directory are restored.
#[instrument(skip(db, status, cancel), fields(root = %status.root.display()))]
pub async fn reset_checkout(
    db: &Db,
    status: &CheckoutStatus,
    cancel: &CancellationToken,
) -> Result<CheckoutStatus> {
    let changes = {
        let root = status.root.clone();
        let since = status.mtime;
        let max_files = db.config().watcher.max_files_watched;
        tokio::task::spawn_blocking(move || changed_since(&root, &PathMatcher::all(), since, max_files))
            .await
            .map_err(|e| Error::Internal(format!("reconcile task failed: {}", e)))??
    };
    if changes.is_empty() {
        debug!("checkout is clean");
        return Ok(status.clone());
    }

    let tree = db.materializer().materialize_all(&status.snapshot, cancel).await?;
    let root = status.root.clone();
    let applier = FsApplier::new(&root);

    let mut writes: Vec<(String, FileNode)> = Vec::new();
    let mut removals: Vec<String> = Vec::new();
    for file_path in &changes.files {
        match tree.get_file(file_path) {
            Some(node) => writes.push((file_path.clone(), node.clone())),
            None => removals.push(file_path.clone()),
        }
    }
    for dir in &changes.dirs {
        match tree.get(dir) {
            Some(Tree::Dir(_)) => {}
            // A directory the snapshot does not have
            _ if !dir.is_empty() => removals.push(dir.clone()),
            _ => {}
        }
    }
    // Files deleted from a changed directory
    for (file_path, node) in tree.files() {
        if changes.files.contains(&file_path) {
            continue;
        }
        let parent = path::split_last(&file_path).map_or("", |(parent, _)| parent);
        let in_changed_dir = changes.dirs.iter().any(|dir| path::is_within(parent, dir));
        if in_changed_dir && fs::symlink_metadata(path::to_os_path(&root, &file_path)).is_err() {
            writes.push((file_path, node.clone()));
        }
    }

    for (file_path, node) in &writes {
        if node.file_type == FileType::Symlink {
            check_symlink(file_path, &node.data)?;
        }
    }

    let (written, removed) = (writes.len(), removals.len());
    let previous = status.mtime;
    let mtime = tokio::task::spawn_blocking(move || -> Result<SystemTime> {
        for rel in &removals {
            applier.remove(rel)?;
        }
        let mut mtime = previous;
        for (file_path, node) in &writes {
            applier.write(file_path, node)?;
            mtime = mtime.max(modified(&path::to_os_path(applier.root(), file_path))?);
        }
        Ok(mtime)
    })
    .await
    .map_err(|e| Error::Internal(format!("reset task failed: {}", e)))??;

    info!(written, removed, "reset checkout");
    Ok(CheckoutStatus {
        root,
        snapshot: status.snapshot.clone(),
        mtime,
        files: tree.len(),
    })
}

fn modified(abs: &Path) -> Result<SystemTime> {
    fs::symlink_metadata(abs)
        .and_then(|m| m.modified())
        .map_err(|e| Error::io(abs, e))
}
