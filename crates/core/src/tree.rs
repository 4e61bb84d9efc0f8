//! In-memory tree values produced by evaluating recipes
//!
//! Directory entries sit behind an `Arc`, so cloning a tree is cheap and a
//! mutation only copies the directories along the mutated path. Content-ID
//! memos are dropped from every directory a mutation passes through.

use crate::error::{Error, Result};
use crate::id::SnapshotId;
use crate::matcher::PathMatcher;
use crate::op::{apply_splices, FileType, Op, Splice};
use crate::path;
use bytes::Bytes;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// A file record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileNode {
    pub data: Bytes,
    pub executable: bool,
    pub file_type: FileType,
    /// Content ID this file is known to have
    pub content_id: Option<SnapshotId>,
}

impl FileNode {
    pub fn new(data: impl Into<Bytes>, executable: bool, file_type: FileType) -> Self {
        Self {
            data: data.into(),
            executable,
            file_type,
            content_id: None,
        }
    }

    /// Same bytes and metadata, or the same known content ID
    pub fn same_content(&self, other: &FileNode) -> bool {
        if let (Some(a), Some(b)) = (&self.content_id, &other.content_id) {
            return a == b;
        }
        self.executable == other.executable
            && self.file_type == other.file_type
            && self.data == other.data
    }

    pub fn is_symlink(&self) -> bool {
        self.file_type == FileType::Symlink
    }
}

/// A directory record
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirNode {
    entries: Arc<BTreeMap<String, Tree>>,
    /// Unchecked content ID memo
    content_id: Option<SnapshotId>,
}

impl DirNode {
    pub fn entries(&self) -> &BTreeMap<String, Tree> {
        &self.entries
    }

    fn entries_mut(&mut self) -> &mut BTreeMap<String, Tree> {
        self.content_id = None;
        Arc::make_mut(&mut self.entries)
    }

    /// Content ID memo; any mutation below this directory clears it
    pub fn content_id(&self) -> Option<&SnapshotId> {
        self.content_id.as_ref()
    }
}

/// What path lookups do when an intermediate directory is missing
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Missing {
    /// Fail with a playback error
    Error,
    /// Create the missing directories
    CreateParents,
    /// Report "nothing there"
    Ignore,
}

/// Flags that change how ops are applied
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct ApplyMode {
    /// Keep every file's bytes empty
    pub strip_contents: bool,
    /// Tolerate paths a pruned evaluation did not produce
    pub lenient: bool,
}

/// A materialized snapshot: a file or a directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tree {
    File(FileNode),
    Dir(DirNode),
}

impl Default for Tree {
    fn default() -> Self {
        Tree::empty()
    }
}

impl Tree {
    /// The empty directory
    pub fn empty() -> Self {
        Tree::Dir(DirNode::default())
    }

    pub fn file(data: impl Into<Bytes>, executable: bool, file_type: FileType) -> Self {
        Tree::File(FileNode::new(data, executable, file_type))
    }

    /// True when the tree holds no files at all
    pub fn is_empty(&self) -> bool {
        match self {
            Tree::File(_) => false,
            Tree::Dir(dir) => dir.entries.values().all(Tree::is_empty),
        }
    }

    pub fn as_dir(&self) -> Option<&DirNode> {
        match self {
            Tree::Dir(dir) => Some(dir),
            Tree::File(_) => None,
        }
    }

    pub fn content_id(&self) -> Option<&SnapshotId> {
        match self {
            Tree::File(f) => f.content_id.as_ref(),
            Tree::Dir(d) => d.content_id.as_ref(),
        }
    }

    pub fn set_content_id(&mut self, id: SnapshotId) {
        match self {
            Tree::File(f) => f.content_id = Some(id),
            Tree::Dir(d) => d.content_id = Some(id),
        }
    }

    /// Node at `path`, if any
    pub fn get(&self, node_path: &str) -> Option<&Tree> {
        let mut node = self;
        for component in path::components(node_path) {
            node = match node {
                Tree::Dir(dir) => dir.entries.get(component)?,
                Tree::File(_) => return None,
            };
        }
        Some(node)
    }

    /// File at `path`, if any
    pub fn get_file(&self, file_path: &str) -> Option<&FileNode> {
        match self.get(file_path)? {
            Tree::File(f) => Some(f),
            Tree::Dir(_) => None,
        }
    }

    /// Walk to the directory at `path`, clearing memos on the way
    pub fn dir_mut(&mut self, dir_path: &str, missing: Missing) -> Result<Option<&mut DirNode>> {
        let mut node = self;
        for component in path::components(dir_path) {
            let dir = match node {
                Tree::Dir(dir) => dir,
                Tree::File(_) if missing == Missing::Ignore => return Ok(None),
                Tree::File(_) => {
                    return Err(Error::playback(format!(
                        "file where directory expected above {:?}",
                        component
                    )))
                }
            };
            node = match dir.entries_mut().entry(component.to_string()) {
                Entry::Occupied(e) => e.into_mut(),
                Entry::Vacant(e) => match missing {
                    Missing::CreateParents => e.insert(Tree::empty()),
                    Missing::Ignore => return Ok(None),
                    Missing::Error => {
                        return Err(Error::playback(format!("directory {:?} does not exist", dir_path)))
                    }
                },
            };
        }
        match node {
            Tree::Dir(dir) => {
                dir.content_id = None;
                Ok(Some(dir))
            }
            Tree::File(_) if missing == Missing::Ignore => Ok(None),
            Tree::File(_) => Err(Error::playback(format!("{:?} is a file, not a directory", dir_path))),
        }
    }

    /// Mutable file at `path`; missing files are a playback error
    pub fn file_mut(&mut self, file_path: &str) -> Result<&mut FileNode> {
        let node = match path::split_last(file_path) {
            None => self,
            Some((parent, name)) => self
                .dir_mut(parent, Missing::Error)?
                .and_then(|dir| dir.entries_mut().get_mut(name))
                .ok_or_else(|| Error::playback(format!("file {:?} does not exist", file_path)))?,
        };
        match node {
            Tree::File(f) => {
                f.content_id = None;
                Ok(f)
            }
            Tree::Dir(_) => Err(Error::playback(format!("{:?} is a directory, not a file", file_path))),
        }
    }

    /// Place `node` at `path`, creating parents
    pub fn insert(&mut self, node_path: &str, node: Tree) -> Result<()> {
        match path::split_last(node_path) {
            None => *self = node,
            Some((parent, name)) => {
                if let Some(dir) = self.dir_mut(parent, Missing::CreateParents)? {
                    dir.entries_mut().insert(name.to_string(), node);
                }
            }
        }
        Ok(())
    }

    /// Remove whatever sits at `path`
    pub fn remove(&mut self, node_path: &str, missing: Missing) -> Result<Option<Tree>> {
        match path::split_last(node_path) {
            None => Ok(Some(std::mem::take(self))),
            Some((parent, name)) => Ok(self
                .dir_mut(parent, missing)?
                .and_then(|dir| dir.entries_mut().remove(name))),
        }
    }

    /// Apply a single-input op to this tree in place
    pub fn apply_linear(&mut self, op: &Op, mode: ApplyMode) -> Result<()> {
        let missing = if mode.lenient { Missing::Ignore } else { Missing::Error };
        match op {
            Op::WriteFile {
                path: file_path,
                data,
                executable,
                file_type,
            } => {
                let data = if mode.strip_contents { Bytes::new() } else { data.clone() };
                self.insert(file_path, Tree::file(data, *executable, *file_type))?;
            }
            Op::RemoveFile { path: file_path } => {
                self.remove(file_path, missing)?;
            }
            Op::InsertBytes {
                path: file_path,
                index,
                data,
            } => {
                let splice = Splice::Insert {
                    index: *index,
                    data: data.clone(),
                };
                self.splice_file(file_path, std::slice::from_ref(&splice), mode)?;
            }
            Op::DeleteBytes {
                path: file_path,
                index,
                count,
            } => {
                let splice = Splice::Delete {
                    index: *index,
                    count: *count,
                };
                self.splice_file(file_path, std::slice::from_ref(&splice), mode)?;
            }
            Op::EditFile {
                path: file_path,
                splices,
            } => {
                self.splice_file(file_path, splices, mode)?;
            }
            Op::ChmodFile {
                path: file_path,
                executable,
            } => {
                self.file_mut(file_path)?.executable = *executable;
            }
            Op::Subdir { path: sub } => {
                let subtree = match self.get(sub) {
                    Some(Tree::File(_)) => {
                        return Err(Error::playback(format!("subdir {:?} is a file", sub)))
                    }
                    Some(node) => node.clone(),
                    None if mode.lenient => Tree::empty(),
                    None => return Err(Error::playback(format!("subdir {:?} does not exist", sub))),
                };
                *self = subtree;
            }
            Op::Preserve {
                matcher,
                strip_contents,
            } => {
                *self = self.filter(matcher, *strip_contents);
            }
            Op::Rmdir { path: dir_path } => {
                self.remove(dir_path, Missing::Ignore)?;
            }
            Op::Identity => {}
            Op::Failure { message } => return Err(Error::playback(message)),
            Op::Dir { .. } | Op::Overlay | Op::SyncCookie { .. } => {
                return Err(Error::Internal(format!("{} is not a linear op", op.name())))
            }
        }
        Ok(())
    }

    fn splice_file(&mut self, file_path: &str, splices: &[Splice], mode: ApplyMode) -> Result<()> {
        let file = self.file_mut(file_path)?;
        if mode.strip_contents {
            return Ok(());
        }
        file.data = Bytes::from(apply_splices(&file.data, splices)?);
        Ok(())
    }

    /// Build a directory holding each input under its name
    ///
    /// Names with several components become nested directories.
    pub fn from_dir(names: &[String], inputs: Vec<Tree>) -> Result<Tree> {
        let mut out = Tree::empty();
        for (name, input) in names.iter().zip(inputs) {
            out.insert(name, input)?;
        }
        Ok(out)
    }

    /// Lay `top` over `base`; directories merge, anything else replaces
    pub fn overlay(base: Tree, top: Tree) -> Tree {
        match (base, top) {
            (Tree::Dir(mut base), Tree::Dir(top)) => {
                if base.entries.is_empty() {
                    return Tree::Dir(top);
                }
                let merged = base.entries_mut();
                for (name, child) in top.entries.iter() {
                    let next = match merged.remove(name) {
                        Some(existing) => Tree::overlay(existing, child.clone()),
                        None => child.clone(),
                    };
                    merged.insert(name.clone(), next);
                }
                Tree::Dir(base)
            }
            (_, top) => top,
        }
    }

    /// Keep only files `matcher` selects, dropping directories left empty
    pub fn filter(&self, matcher: &PathMatcher, strip_contents: bool) -> Tree {
        if matcher.is_all() && !strip_contents {
            return self.clone();
        }
        match self {
            Tree::File(f) if matcher.matches("") => Tree::File(strip(f, strip_contents)),
            Tree::File(_) => Tree::empty(),
            Tree::Dir(dir) => {
                let mut out = BTreeMap::new();
                for (name, child) in dir.entries.iter() {
                    match child {
                        Tree::File(f) => {
                            if matcher.matches(name) {
                                out.insert(name.clone(), Tree::File(strip(f, strip_contents)));
                            }
                        }
                        Tree::Dir(_) => {
                            let sub = matcher.child(name);
                            if sub.is_empty() {
                                continue;
                            }
                            let kept = child.filter(&sub, strip_contents);
                            if !kept.is_empty() {
                                out.insert(name.clone(), kept);
                            }
                        }
                    }
                }
                Tree::Dir(DirNode {
                    entries: Arc::new(out),
                    content_id: None,
                })
            }
        }
    }

    /// Every file with its path, in path order
    pub fn files(&self) -> Vec<(String, &FileNode)> {
        let mut out = Vec::new();
        self.collect_files("", &mut out);
        out
    }

    fn collect_files<'a>(&'a self, prefix: &str, out: &mut Vec<(String, &'a FileNode)>) {
        match self {
            Tree::File(f) => out.push((prefix.to_string(), f)),
            Tree::Dir(dir) => {
                for (name, child) in dir.entries.iter() {
                    child.collect_files(&path::join(prefix, name), out);
                }
            }
        }
    }

    /// Set of file paths
    pub fn paths(&self) -> BTreeSet<String> {
        self.files().into_iter().map(|(p, _)| p).collect()
    }

    /// Number of files
    pub fn len(&self) -> usize {
        match self {
            Tree::File(_) => 1,
            Tree::Dir(dir) => dir.entries.values().map(Tree::len).sum(),
        }
    }
}

fn strip(file: &FileNode, strip_contents: bool) -> FileNode {
    if !strip_contents {
        return file.clone();
    }
    FileNode {
        data: Bytes::new(),
        executable: file.executable,
        file_type: file.file_type,
        content_id: None,
    }
}

/// File-level differences between two trees
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeDiff {
    /// Files only in the new tree
    pub added: Vec<String>,
    /// Files only in the old tree
    pub removed: Vec<String>,
    /// Files in both whose content or metadata changed
    pub modified: Vec<String>,
}

impl TreeDiff {
    /// Compute the diff between two trees
    pub fn diff(old: &Tree, new: &Tree) -> Self {
        let mut diff = TreeDiff::default();
        diff.walk("", Some(old), Some(new));
        diff
    }

    fn walk(&mut self, prefix: &str, old: Option<&Tree>, new: Option<&Tree>) {
        match (old, new) {
            (None, None) => {}
            (Some(Tree::File(a)), Some(Tree::File(b))) => {
                if !a.same_content(b) {
                    self.modified.push(prefix.to_string());
                }
            }
            (Some(Tree::Dir(a)), Some(Tree::Dir(b))) => {
                if Arc::ptr_eq(&a.entries, &b.entries) {
                    return;
                }
                if let (Some(x), Some(y)) = (&a.content_id, &b.content_id) {
                    if x == y {
                        return;
                    }
                }
                let names: BTreeSet<&String> = a.entries.keys().chain(b.entries.keys()).collect();
                for name in names {
                    self.walk(
                        &path::join(prefix, name),
                        a.entries.get(name.as_str()),
                        b.entries.get(name.as_str()),
                    );
                }
            }
            (old, new) => {
                if let Some(old) = old {
                    self.removed.extend(old.paths().into_iter().map(|p| path::join(prefix, &p)));
                }
                if let Some(new) = new {
                    self.added.extend(new.paths().into_iter().map(|p| path::join(prefix, &p)));
                }
            }
        }
    }

    /// Check if there are any changes
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }

    /// Every path that differs, sorted
    pub fn changed_paths(&self) -> BTreeSet<String> {
        self.added
            .iter()
            .chain(&self.removed)
            .chain(&self.modified)
            .cloned()
            .collect()
    }
}
