//! Filesystem watching for snapmirror
//!
//! This crate provides:
//! - Matcher-aware directory scanning with symlink normalization
//! - OS watch-limit checks
//! - Coalescing of raw OS events
//! - Diff-based op synthesis (edit vs. write, chmod, type replacement)
//! - The watcher loop with FSync cookies and per-path notifications
//! - One-shot directory snapshots and mtime-restricted rescans

pub mod coalesce;
pub mod limits;
pub mod reconcile;
pub mod scan;
pub mod snapshot;
pub mod synth;
pub mod watcher;

pub use coalesce::{Coalescer, RawEvent, RawKind};
pub use limits::check_limits;
pub use reconcile::{changed_since, Changes};
pub use scan::{EntryKind, PathState, Scan, ScanEntry, Scanner};
pub use snapshot::{read_dir_tree, snapshot_dir};
pub use synth::{file_ops, synthesize};
pub use watcher::{TagProvider, WatchEvent, WatchOptions, Watcher};
