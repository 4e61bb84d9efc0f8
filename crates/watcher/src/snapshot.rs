//! One-shot directory snapshots

use crate::scan::Scanner;
use snap_core::{Error, OwnerId, PathMatcher, RecipeStore, Result, SnapshotId, Tree, WatcherConfig};
use snap_eval::DirAssembler;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, instrument};

/// Read the tracked files under `root` into a tree
pub fn read_dir_tree(scanner: &Scanner) -> Result<Tree> {
    let scan = scanner.scan("")?;
    let mut tree = Tree::empty();
    for (rel, entry) in &scan.files {
        if let Some(node) = scanner.read(entry)? {
            tree.insert(rel, Tree::File(node))?;
        }
    }
    Ok(tree)
}

/// Snapshot the matched contents of `root` as a content ID
#[instrument(skip(store, root, matcher, config), fields(root = %root.display()))]
pub async fn snapshot_dir(
    store: Arc<dyn RecipeStore>,
    root: &Path,
    matcher: &PathMatcher,
    owner: OwnerId,
    config: &WatcherConfig,
) -> Result<SnapshotId> {
    let root = Scanner::canonical_root(root)?;
    let scanner = Scanner::new(root, matcher.clone(), config.max_files_watched);
    let tree = tokio::task::spawn_blocking(move || read_dir_tree(&scanner))
        .await
        .map_err(|e| Error::Internal(format!("scan task failed: {}", e)))??;
    let id = DirAssembler::new(store, owner).assemble(&tree).await?;
    info!(id = %id, files = tree.len(), "snapshotted directory");
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use snap_core::MemoryRecipeStore;
    use snap_eval::Materializer;
    use std::fs;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_snapshot_dir_round_trips() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/lib.rs"), "pub fn f() {}").unwrap();
        fs::write(dir.path().join("notes.md"), "notes").unwrap();

        let store = Arc::new(MemoryRecipeStore::new());
        let config = WatcherConfig::default();
        let id = snapshot_dir(store.clone(), dir.path(), &PathMatcher::all(), OwnerId(1), &config)
            .await
            .unwrap();
        assert!(id.is_content());

        // Same contents, same ID
        let again = snapshot_dir(store.clone(), dir.path(), &PathMatcher::all(), OwnerId(1), &config)
            .await
            .unwrap();
        assert_eq!(id, again);

        let tree = Materializer::new(store)
            .materialize_all(&id, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(&tree.get_file("src/lib.rs").unwrap().data[..], b"pub fn f() {}");
        assert_eq!(tree.len(), 2);
    }

    #[tokio::test]
    async fn test_snapshot_of_empty_dir_is_empty() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("nothing_here")).unwrap();
        let store = Arc::new(MemoryRecipeStore::new());
        let id = snapshot_dir(
            store,
            dir.path(),
            &PathMatcher::all(),
            OwnerId(1),
            &WatcherConfig::default(),
        )
        .await
        .unwrap();
        assert_eq!(id, SnapshotId::Empty);
    }
}
