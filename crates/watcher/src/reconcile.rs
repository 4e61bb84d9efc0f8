//! Mtime-restricted rescans
//!
//! Finds what changed under a root since a watermark without a running
//! watcher: files modified after it, and directories whose listing changed
//! after it (a deleted file only shows up as its parent's mtime).

use crate::scan::Scanner;
use snap_core::{PathMatcher, Result};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::SystemTime;
use tracing::debug;

/// Paths changed after a watermark
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Changes {
    /// Files modified after the watermark
    pub files: BTreeSet<String>,
    /// Directories modified after the watermark, the root being ""
    pub dirs: BTreeSet<String>,
}

impl Changes {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.dirs.is_empty()
    }
}

/// Scan `root` for changes made after `since`
pub fn changed_since(
    root: &Path,
    matcher: &PathMatcher,
    since: SystemTime,
    max_files: usize,
) -> Result<Changes> {
    let root = Scanner::canonical_root(root)?;
    let scan = Scanner::new(root, matcher.clone(), max_files)
        .with_min_mtime(Some(since))
        .scan("")?;
    let changes = Changes {
        files: scan
            .files
            .into_iter()
            .filter(|(_, entry)| !entry.stale)
            .map(|(rel, _)| rel)
            .collect(),
        dirs: scan.changed_dirs.into_iter().collect(),
    };
    debug!(
        files = changes.files.len(),
        dirs = changes.dirs.len(),
        "reconcile scan"
    );
    Ok(changes)
}
