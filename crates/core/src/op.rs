//! Operations: immutable descriptors of how a snapshot differs from its inputs

use crate::error::{Error, Result};
use crate::matcher::PathMatcher;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;

/// Fixed cost charged per op by the edit-vs-write heuristic
pub const OP_COST: u64 = 10;

/// Type of a file entry
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FileType {
    #[default]
    Regular,
    Symlink,
}

impl FileType {
    /// Index used when hashing non-regular files
    pub fn index(&self) -> u8 {
        match self {
            FileType::Regular => 0,
            FileType::Symlink => 1,
        }
    }
}

/// One step of an `EditFile` op
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Splice {
    Insert { index: u64, data: Bytes },
    Delete { index: u64, count: u64 },
}

/// Ordered splice list carried by `EditFile`
pub type Splices = SmallVec<[Splice; 4]>;

/// The exhaustive set of recipe operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    WriteFile {
        path: String,
        data: Bytes,
        executable: bool,
        file_type: FileType,
    },
    RemoveFile {
        path: String,
    },
    InsertBytes {
        path: String,
        index: u64,
        data: Bytes,
    },
    DeleteBytes {
        path: String,
        index: u64,
        count: u64,
    },
    EditFile {
        path: String,
        splices: Splices,
    },
    ChmodFile {
        path: String,
        executable: bool,
    },
    /// Take the subtree rooted at `path`
    Subdir {
        path: String,
    },
    /// Combine N input trees as named children
    Dir {
        names: Vec<String>,
    },
    /// Combine N input trees, later inputs win per path
    Overlay,
    /// Keep only matching paths, optionally zeroing their contents
    Preserve {
        matcher: PathMatcher,
        strip_contents: bool,
    },
    Rmdir {
        path: String,
    },
    Identity,
    Failure {
        message: String,
    },
    /// Only ever travels through in-memory channels
    SyncCookie {
        token: String,
    },
}

impl Op {
    /// Regular, non-executable file write
    pub fn write(path: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Op::WriteFile {
            path: path.into(),
            data: data.into(),
            executable: false,
            file_type: FileType::Regular,
        }
    }

    pub fn symlink(path: impl Into<String>, target: impl Into<Bytes>) -> Self {
        Op::WriteFile {
            path: path.into(),
            data: target.into(),
            executable: false,
            file_type: FileType::Symlink,
        }
    }

    pub fn remove(path: impl Into<String>) -> Self {
        Op::RemoveFile { path: path.into() }
    }

    /// Short name used in logs and errors
    pub fn name(&self) -> &'static str {
        match self {
            Op::WriteFile { .. } => "writeFile",
            Op::RemoveFile { .. } => "removeFile",
            Op::InsertBytes { .. } => "insertBytes",
            Op::DeleteBytes { .. } => "deleteBytes",
            Op::EditFile { .. } => "editFile",
            Op::ChmodFile { .. } => "chmodFile",
            Op::Subdir { .. } => "subdir",
            Op::Dir { .. } => "dir",
            Op::Overlay => "overlay",
            Op::Preserve { .. } => "preserve",
            Op::Rmdir { .. } => "rmdir",
            Op::Identity => "identity",
            Op::Failure { .. } => "failure",
            Op::SyncCookie { .. } => "syncCookie",
        }
    }

    /// Path touched by a single-path op
    pub fn path(&self) -> Option<&str> {
        match self {
            Op::WriteFile { path, .. }
            | Op::RemoveFile { path }
            | Op::InsertBytes { path, .. }
            | Op::DeleteBytes { path, .. }
            | Op::EditFile { path, .. }
            | Op::ChmodFile { path, .. }
            | Op::Subdir { path }
            | Op::Rmdir { path } => Some(path),
            _ => None,
        }
    }

    /// Copy of a single-path op with its path replaced
    pub fn with_path(&self, new_path: impl Into<String>) -> Option<Op> {
        let new_path = new_path.into();
        let mut op = self.clone();
        match &mut op {
            Op::WriteFile { path, .. }
            | Op::RemoveFile { path }
            | Op::InsertBytes { path, .. }
            | Op::DeleteBytes { path, .. }
            | Op::EditFile { path, .. }
            | Op::ChmodFile { path, .. }
            | Op::Subdir { path }
            | Op::Rmdir { path } => *path = new_path,
            _ => return None,
        }
        Some(op)
    }

    /// Ops that edit one path of their single input and can be replayed
    /// directly against a directory on disk
    pub fn is_file_op(&self) -> bool {
        matches!(
            self,
            Op::WriteFile { .. }
                | Op::RemoveFile { .. }
                | Op::InsertBytes { .. }
                | Op::DeleteBytes { .. }
                | Op::EditFile { .. }
                | Op::ChmodFile { .. }
                | Op::Rmdir { .. }
        )
    }

    /// Ops that accept at most one input
    pub fn is_linear(&self) -> bool {
        !matches!(self, Op::Dir { .. } | Op::Overlay)
    }

    /// Ops allowed under the Optimal tag
    pub fn is_optimal_form(&self) -> bool {
        match self {
            Op::WriteFile { path, .. } => path.is_empty(),
            Op::Dir { .. } | Op::Identity => true,
            _ => false,
        }
    }

    /// Check the number of inputs against the op's arity rules
    pub fn check_arity(&self, inputs: usize) -> Result<()> {
        let ok = match self {
            Op::Dir { names } => inputs == names.len(),
            Op::Overlay => inputs >= 1,
            Op::Failure { .. } | Op::SyncCookie { .. } => inputs <= 1,
            _ => inputs <= 1,
        };
        if ok {
            Ok(())
        } else {
            Err(Error::InvalidArgument(format!(
                "{} does not accept {} inputs",
                self.name(),
                inputs
            )))
        }
    }

    /// Validate paths and names carried by the op
    pub fn validate(&self) -> Result<()> {
        if let Some(path) = self.path() {
            crate::path::validate(path)?;
        }
        match self {
            Op::Dir { names } => {
                for name in names {
                    if name.is_empty() {
                        return Err(Error::InvalidArgument("dir name may not be empty".into()));
                    }
                    crate::path::validate(name)?;
                }
                Ok(())
            }
            Op::SyncCookie { .. } => Err(Error::InvalidArgument(
                "sync cookies cannot be stored".into(),
            )),
            _ => Ok(()),
        }
    }

    /// Heuristic cost used to pick between editFile and writeFile
    ///
    /// 10 per op, plus every inserted byte, plus 1 per splice.
    pub fn cost(&self) -> u64 {
        match self {
            Op::WriteFile { data, .. } | Op::InsertBytes { data, .. } => OP_COST + data.len() as u64,
            Op::DeleteBytes { .. } => OP_COST + 1,
            Op::EditFile { splices, .. } => {
                OP_COST
                    + splices
                        .iter()
                        .map(|s| match s {
                            Splice::Insert { data, .. } => data.len() as u64 + 1,
                            Splice::Delete { .. } => 1,
                        })
                        .sum::<u64>()
            }
            _ => OP_COST,
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::WriteFile {
                path,
                data,
                executable,
                file_type,
            } => write!(
                f,
                "writeFile({:?}, {} bytes, exec={}, {:?})",
                path,
                data.len(),
                executable,
                file_type
            ),
            Op::InsertBytes { path, index, data } => {
                write!(f, "insertBytes({:?}, @{}, {} bytes)", path, index, data.len())
            }
            Op::DeleteBytes { path, index, count } => {
                write!(f, "deleteBytes({:?}, @{}, {})", path, index, count)
            }
            Op::EditFile { path, splices } => {
                write!(f, "editFile({:?}, {} splices)", path, splices.len())
            }
            Op::ChmodFile { path, executable } => {
                write!(f, "chmodFile({:?}, exec={})", path, executable)
            }
            Op::Dir { names } => write!(f, "dir({:?})", names),
            Op::Preserve {
                matcher,
                strip_contents,
            } => write!(f, "preserve({}, strip={})", matcher, strip_contents),
            Op::Failure { message } => write!(f, "failure({:?})", message),
            Op::SyncCookie { token } => write!(f, "syncCookie({:?})", token),
            other => match other.path() {
                Some(path) => write!(f, "{}({:?})", other.name(), path),
                None => write!(f, "{}", other.name()),
            },
        }
    }
}

/// Apply splices one after another, each index referring to the buffer as
/// left by the previous splice
pub fn apply_splices(buf: &[u8], splices: &[Splice]) -> Result<Vec<u8>> {
    let mut out = buf.to_vec();
    for splice in splices {
        match splice {
            Splice::Insert { index, data } => {
                let at = *index as usize;
                if at > out.len() {
                    return Err(Error::playback(format!(
                        "insert at {} past end of {} byte file",
                        at,
                        out.len()
                    )));
                }
                out.splice(at..at, data.iter().copied());
            }
            Splice::Delete { index, count } => {
                let start = *index as usize;
                let end = start.saturating_add(*count as usize);
                if end > out.len() {
                    return Err(Error::playback(format!(
                        "delete {}..{} past end of {} byte file",
                        start,
                        end,
                        out.len()
                    )));
                }
                out.drain(start..end);
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    #[test]
    fn test_apply_splices_sequential_indices() {
        let splices = vec![
            Splice::Delete { index: 0, count: 2 },
            Splice::Insert {
                index: 0,
                data: Bytes::from_static(b"HE"),
            },
            Splice::Insert {
                index: 5,
                data: Bytes::from_static(b"!"),
            },
        ];
        let out = apply_splices(b"hello", &splices).unwrap();
        assert_eq!(out, b"HEllo!");
    }

    #[test]
    fn test_apply_splices_out_of_range() {
        assert!(apply_splices(b"abc", &[Splice::Delete { index: 2, count: 5 }]).is_err());
        assert!(apply_splices(
            b"abc",
            &[Splice::Insert {
                index: 9,
                data: Bytes::from_static(b"x")
            }]
        )
        .is_err());
    }

    #[test]
    fn test_arity() {
        assert!(Op::write("a", "x").check_arity(0).is_ok());
        assert!(Op::write("a", "x").check_arity(1).is_ok());
        assert!(Op::write("a", "x").check_arity(2).is_err());
        assert!(Op::Overlay.check_arity(0).is_err());
        assert!(Op::Overlay.check_arity(3).is_ok());
        let dir = Op::Dir {
            names: vec!["a".into(), "b".into()],
        };
        assert!(dir.check_arity(2).is_ok());
        assert!(dir.check_arity(1).is_err());
    }

    #[test]
    fn test_cost_heuristic() {
        assert_eq!(Op::write("a", "hello").cost(), 15);
        let edit = Op::EditFile {
            path: "a".into(),
            splices: smallvec![
                Splice::Delete { index: 0, count: 3 },
                Splice::Insert {
                    index: 0,
                    data: Bytes::from_static(b"xy")
                },
            ],
        };
        assert_eq!(edit.cost(), 10 + 1 + 3);
    }

    #[test]
    fn test_with_path() {
        let op = Op::write("a.txt", "x").with_path("sub/a.txt").unwrap();
        assert_eq!(op.path(), Some("sub/a.txt"));
        assert!(Op::Overlay.with_path("x").is_none());
    }

    #[test]
    fn test_validate_rejects_cookie_and_bad_paths() {
        assert!(Op::SyncCookie { token: "t".into() }.validate().is_err());
        assert!(Op::write("../a", "x").validate().is_err());
        assert!(Op::Dir { names: vec!["".into()] }.validate().is_err());
    }
}
