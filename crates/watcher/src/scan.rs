//! Directory scanning that honors a path matcher
//!
//! A directory is descended into only if the matcher could select something
//! below it; a file or symlink is kept only if the matcher selects it.
//! Symlinks are normalized to relative targets and skipped when they are
//! broken or lead outside the root.

use snap_core::{path, Error, FileNode, FileType, PathMatcher, Result};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

/// Kind of a tracked filesystem entry
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Symlink,
}

/// A file or symlink found on disk
#[derive(Debug, Clone)]
pub struct ScanEntry {
    pub abs: PathBuf,
    /// Slash-separated path below the root
    pub rel: String,
    pub kind: EntryKind,
    pub executable: bool,
    pub mtime: SystemTime,
    /// Not modified after the scanner's minimum mtime
    pub stale: bool,
}

/// Result of scanning one subtree
#[derive(Debug, Default)]
pub struct Scan {
    pub files: BTreeMap<String, ScanEntry>,
    /// Every directory visited, the scanned directory included
    pub dirs: Vec<String>,
    /// Directories whose mtime is after the minimum mtime
    pub changed_dirs: Vec<String>,
}

/// What a single path currently is on disk
#[derive(Debug, Clone)]
pub enum PathState {
    Missing,
    Dir,
    Entry(ScanEntry),
}

#[derive(Debug, Clone)]
pub struct Scanner {
    root: PathBuf,
    matcher: PathMatcher,
    max_files: usize,
    min_mtime: Option<SystemTime>,
}

impl Scanner {
    /// `root` must be canonical, see [`Scanner::canonical_root`]
    pub fn new(root: PathBuf, matcher: PathMatcher, max_files: usize) -> Self {
        Self {
            root,
            matcher,
            max_files,
            min_mtime: None,
        }
    }

    /// Flag entries not modified after `min_mtime` as stale
    pub fn with_min_mtime(mut self, min_mtime: Option<SystemTime>) -> Self {
        self.min_mtime = min_mtime;
        self
    }

    /// Resolve symlinks on a root directory
    pub fn canonical_root(root: &Path) -> Result<PathBuf> {
        let real = fs::canonicalize(root).map_err(|e| Error::io(root, e))?;
        if !real.is_dir() {
            return Err(Error::InvalidArgument(format!(
                "{} is not a directory",
                root.display()
            )));
        }
        Ok(real)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn matcher(&self) -> &PathMatcher {
        &self.matcher
    }

    /// Slash-separated path of `abs` below the root; `None` when outside the
    /// root. Names that are not UTF-8 are escaped with [`path::from_os_name`].
    pub fn rel_path(&self, abs: &Path) -> Option<String> {
        let rel = abs.strip_prefix(&self.root).ok()?;
        let mut parts = Vec::new();
        for component in rel.components() {
            match component {
                Component::Normal(name) => parts.push(path::from_os_name(name)),
                _ => return None,
            }
        }
        Some(parts.join("/"))
    }

    pub fn abs_path(&self, rel: &str) -> PathBuf {
        path::to_os_path(&self.root, rel)
    }

    /// Whether a directory at `rel` could hold tracked files
    pub fn wants_dir(&self, rel: &str) -> bool {
        !self.matcher.child(rel).is_empty()
    }

    /// Scan the subtree at `rel`
    pub fn scan(&self, rel: &str) -> Result<Scan> {
        let start = self.abs_path(rel);
        let mut scan = Scan::default();
        let walker = WalkDir::new(&start)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| self.wanted(e));

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) if e.io_error().map_or(false, |io| io.kind() == ErrorKind::NotFound) => continue,
                Err(e) => {
                    let at = e.path().map_or_else(|| start.clone(), Path::to_path_buf);
                    return Err(Error::io(at, e.into()));
                }
            };
            let Some(entry_rel) = self.rel_path(entry.path()) else {
                continue;
            };
            let file_type = entry.file_type();
            if file_type.is_dir() {
                if self.newer_than_min(entry.metadata().ok().and_then(|m| m.modified().ok())) {
                    scan.changed_dirs.push(entry_rel.clone());
                }
                scan.dirs.push(entry_rel);
                continue;
            }
            let meta = match entry.metadata() {
                Ok(meta) => meta,
                Err(e) if e.io_error().map_or(false, |io| io.kind() == ErrorKind::NotFound) => continue,
                Err(e) => return Err(Error::io(entry.path(), e.into())),
            };
            let Some(found) = self.entry(entry.path().to_path_buf(), entry_rel, &meta) else {
                continue;
            };
            if scan.files.len() >= self.max_files {
                return Err(Error::TooManyFiles {
                    limit: self.max_files,
                });
            }
            scan.files.insert(found.rel.clone(), found);
        }
        debug!(
            root = %start.display(),
            files = scan.files.len(),
            dirs = scan.dirs.len(),
            "scanned"
        );
        Ok(scan)
    }

    /// Current state of one path
    pub fn stat(&self, rel: &str) -> Result<PathState> {
        let abs = self.abs_path(rel);
        let meta = match fs::symlink_metadata(&abs) {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(PathState::Missing),
            Err(e) => return Err(Error::io(abs, e)),
        };
        if meta.is_dir() {
            return Ok(if self.wants_dir(rel) {
                PathState::Dir
            } else {
                PathState::Missing
            });
        }
        if !self.matcher.matches(rel) {
            return Ok(PathState::Missing);
        }
        Ok(match self.entry(abs, rel.to_string(), &meta) {
            Some(entry) => PathState::Entry(entry),
            None => PathState::Missing,
        })
    }

    /// Contents of a scanned entry; `None` when it vanished or is a symlink
    /// that must be skipped
    pub fn read(&self, entry: &ScanEntry) -> Result<Option<FileNode>> {
        match entry.kind {
            EntryKind::File => match fs::read(&entry.abs) {
                Ok(data) => Ok(Some(FileNode::new(data, entry.executable, FileType::Regular))),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
                Err(e) => Err(Error::io(&entry.abs, e)),
            },
            EntryKind::Symlink => Ok(self
                .link_target(&entry.rel, &entry.abs)?
                .map(|target| FileNode::new(target, false, FileType::Symlink))),
        }
    }

    fn wanted(&self, entry: &DirEntry) -> bool {
        let Some(rel) = self.rel_path(entry.path()) else {
            warn!(path = %entry.path().display(), "skipping path outside the root");
            return false;
        };
        if entry.file_type().is_dir() {
            rel.is_empty() || self.wants_dir(&rel)
        } else {
            self.matcher.matches(&rel)
        }
    }

    fn entry(&self, abs: PathBuf, rel: String, meta: &fs::Metadata) -> Option<ScanEntry> {
        let kind = if meta.file_type().is_symlink() {
            EntryKind::Symlink
        } else if meta.is_file() {
            EntryKind::File
        } else {
            return None;
        };
        let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        Some(ScanEntry {
            abs,
            rel,
            kind,
            executable: kind == EntryKind::File && is_executable(meta),
            mtime,
            stale: !self.newer_than_min(Some(mtime)),
        })
    }

    fn newer_than_min(&self, mtime: Option<SystemTime>) -> bool {
        match (self.min_mtime, mtime) {
            (None, _) => true,
            (Some(min), Some(mtime)) => mtime > min,
            (Some(_), None) => true,
        }
    }

    /// Relative target of the symlink at `rel`, or `None` to skip it
    fn link_target(&self, rel: &str, abs: &Path) -> Result<Option<Vec<u8>>> {
        let target = match fs::read_link(abs) {
            Ok(target) => target,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::io(abs, e)),
        };
        let parent = rel.rsplit_once('/').map_or("", |(parent, _)| parent);

        let text = if target.is_absolute() {
            let inside = target
                .strip_prefix(&self.root)
                .ok()
                .and_then(|p| resolve(&[], p));
            match inside {
                Some(inside) => path::decode_name(&relative_to(parent, &inside)),
                None => {
                    debug!(link = rel, target = %target.display(), "skipping symlink outside root");
                    return Ok(None);
                }
            }
        } else {
            let base: Vec<&str> = parent.split('/').filter(|c| !c.is_empty()).collect();
            if resolve(&base, &target).is_none() {
                debug!(link = rel, target = %target.display(), "skipping symlink outside root");
                return Ok(None);
            }
            os_bytes(target.as_os_str())
        };

        if fs::metadata(abs).is_err() {
            debug!(link = rel, "skipping broken symlink");
            return Ok(None);
        }
        Ok(Some(text))
    }
}

/// Lexically resolve `target` against `base` components; `None` when it
/// climbs above the root
pub(crate) fn resolve(base: &[&str], target: &Path) -> Option<Vec<String>> {
    let mut out: Vec<String> = base.iter().map(|c| c.to_string()).collect();
    for component in target.components() {
        match component {
            Component::Normal(name) => out.push(path::from_os_name(name)),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop()?;
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(out)
}

#[cfg(unix)]
fn os_bytes(text: &std::ffi::OsStr) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;
    text.as_bytes().to_vec()
}

#[cfg(not(unix))]
fn os_bytes(text: &std::ffi::OsStr) -> Vec<u8> {
    text.to_string_lossy().into_owned().into_bytes()
}

/// Path from directory `from` to `to`, both relative to the root
fn relative_to(from: &str, to: &[String]) -> String {
    let from: Vec<&str> = from.split('/').filter(|c| !c.is_empty()).collect();
    let common = from
        .iter()
        .zip(to)
        .take_while(|(a, b)| **a == b.as_str())
        .count();
    let mut parts: Vec<&str> = vec![".."; from.len() - common];
    parts.extend(to[common..].iter().map(String::as_str));
    if parts.is_empty() {
        ".".to_string()
    } else {
        parts.join("/")
    }
}

#[cfg(unix)]
fn is_executable(meta: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &fs::Metadata) -> bool {
    false
}
