//! Replaying linear ops against a directory on disk
//!
//! Files are written with mode 0600 (0700 when executable) and directories
//! with 0700. Symlinks must hold a relative target that stays inside the
//! root; anything else is refused before the disk is touched.

use snap_core::{apply_splices, path, Error, FileNode, FileType, Op, Result, Splice};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

const FILE_MODE: u32 = 0o600;
const EXEC_MODE: u32 = 0o700;
const DIR_MODE: u32 = 0o700;

/// Applies ops to the directory tree under `root`
#[derive(Debug, Clone)]
pub struct FsApplier {
    root: PathBuf,
}

impl FsApplier {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn abs(&self, rel: &str) -> Result<PathBuf> {
        path::validate(rel)?;
        if rel.is_empty() {
            return Err(Error::InvalidArgument("op targets the checkout root".to_string()));
        }
        Ok(path::to_os_path(&self.root, rel))
    }

    /// Refuse `op` if it would create a symlink escaping the root
    pub fn check(&self, op: &Op) -> Result<()> {
        match op {
            Op::WriteFile {
                path: link,
                data,
                file_type: FileType::Symlink,
                ..
            } => check_symlink(link, data),
            _ => Ok(()),
        }
    }

    /// Check every op, then apply them in order
    pub fn apply_all(&self, ops: &[Op]) -> Result<()> {
        for op in ops {
            self.check(op)?;
        }
        for op in ops {
            self.apply(op)?;
        }
        Ok(())
    }

    pub fn apply(&self, op: &Op) -> Result<()> {
        match op {
            Op::WriteFile {
                path: rel,
                data,
                executable,
                file_type,
            } => self.write(rel, &FileNode::new(data.clone(), *executable, *file_type)),
            Op::RemoveFile { path: rel } => {
                let abs = self.abs(rel)?;
                match fs::remove_file(&abs) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        debug!(path = %rel, "file already gone");
                    }
                    Err(e) => return Err(Error::io(abs, e)),
                }
                self.prune(rel)
            }
            Op::Rmdir { path: rel } => {
                let abs = self.abs(rel)?;
                match fs::remove_dir_all(&abs) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
                    Err(e) => return Err(Error::io(abs, e)),
                }
                self.prune(rel)
            }
            Op::InsertBytes {
                path: rel,
                index,
                data,
            } => self.splice(
                rel,
                &[Splice::Insert {
                    index: *index,
                    data: data.clone(),
                }],
            ),
            Op::DeleteBytes {
                path: rel,
                index,
                count,
            } => self.splice(
                rel,
                &[Splice::Delete {
                    index: *index,
                    count: *count,
                }],
            ),
            Op::EditFile { path: rel, splices } => self.splice(rel, splices),
            Op::ChmodFile {
                path: rel,
                executable,
            } => {
                let abs = self.abs(rel)?;
                let meta = fs::symlink_metadata(&abs).map_err(|e| Error::io(&abs, e))?;
                if meta.file_type().is_symlink() {
                    return Ok(());
                }
                set_mode(&abs, if *executable { EXEC_MODE } else { FILE_MODE })
            }
            Op::Identity => Ok(()),
            other => Err(Error::InvalidArgument(format!(
                "{} cannot be applied to a directory",
                other.name()
            ))),
        }
    }

    /// Write one file node at `rel`, replacing whatever is there
    pub fn write(&self, rel: &str, node: &FileNode) -> Result<()> {
        let abs = self.abs(rel)?;
        if node.file_type == FileType::Symlink {
            check_symlink(rel, &node.data)?;
        }
        if let Some(parent) = abs.parent() {
            create_dirs(parent)?;
        }
        remove_entry(&abs)?;

        match node.file_type {
            FileType::Regular => {
                fs::write(&abs, &node.data).map_err(|e| Error::io(&abs, e))?;
                set_mode(&abs, if node.executable { EXEC_MODE } else { FILE_MODE })
            }
            FileType::Symlink => make_symlink(&node.data, &abs),
        }
    }

    /// Remove `rel` and any parent directories left empty by it
    pub fn remove(&self, rel: &str) -> Result<()> {
        let abs = self.abs(rel)?;
        remove_entry(&abs)?;
        self.prune(rel)
    }

    /// Remove every entry under the root, keeping the root itself
    pub fn clear(&self) -> Result<()> {
        let entries = fs::read_dir(&self.root).map_err(|e| Error::io(&self.root, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| Error::io(&self.root, e))?;
            remove_entry(&entry.path())?;
        }
        debug!(root = %self.root.display(), "cleared directory");
        Ok(())
    }

    fn splice(&self, rel: &str, splices: &[Splice]) -> Result<()> {
        let abs = self.abs(rel)?;
        let meta = fs::symlink_metadata(&abs).map_err(|e| Error::io(&abs, e))?;
        if meta.file_type().is_symlink() {
            let target = fs::read_link(&abs).map_err(|e| Error::io(&abs, e))?;
            let target = path::decode_name(&path::from_os_name(target.as_os_str()));
            let spliced = apply_splices(&target, splices)?;
            check_symlink(rel, &spliced)?;
            remove_entry(&abs)?;
            return make_symlink(&spliced, &abs);
        }
        let data = fs::read(&abs).map_err(|e| Error::io(&abs, e))?;
        let spliced = apply_splices(&data, splices)?;
        fs::write(&abs, spliced).map_err(|e| Error::io(&abs, e))
    }

    /// Remove empty directories above `rel`, never the root
    fn prune(&self, rel: &str) -> Result<()> {
        let mut current = rel;
        while let Some((parent, _)) = path::split_last(current) {
            if parent.is_empty() {
                break;
            }
            let abs = path::to_os_path(&self.root, parent);
            match fs::remove_dir(&abs) {
                Ok(()) => debug!(dir = %parent, "removed empty directory"),
                // Not empty, or already gone
                Err(_) => break,
            }
            current = parent;
        }
        Ok(())
    }
}

/// Reject symlink targets that are absolute or resolve outside the root
pub fn check_symlink(link: &str, target: &[u8]) -> Result<()> {
    let escape = || Error::SymlinkEscape {
        path: link.to_string(),
        target: String::from_utf8_lossy(target).into_owned(),
    };
    let target = path::encode_name(target);
    if target.is_empty() || target.starts_with('/') {
        return Err(escape());
    }

    // Resolve against the directory holding the link
    let mut depth: Vec<&str> = match path::split_last(link) {
        Some((parent, _)) => path::components(parent).collect(),
        None => Vec::new(),
    };
    for component in target.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                if depth.pop().is_none() {
                    return Err(escape());
                }
            }
            name => depth.push(name),
        }
    }
    if depth.is_empty() {
        // Pointing at the root itself
        return Err(escape());
    }
    Ok(())
}

fn remove_entry(abs: &Path) -> Result<()> {
    let meta = match fs::symlink_metadata(abs) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(Error::io(abs, e)),
    };
    let removed = if meta.is_dir() {
        fs::remove_dir_all(abs)
    } else {
        fs::remove_file(abs)
    };
    removed.map_err(|e| Error::io(abs, e))
}

fn create_dirs(dir: &Path) -> Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(DIR_MODE);
    }
    builder.create(dir).map_err(|e| Error::io(dir, e))
}

#[cfg(unix)]
fn set_mode(abs: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(abs, fs::Permissions::from_mode(mode)).map_err(|e| Error::io(abs, e))
}

#[cfg(not(unix))]
fn set_mode(_abs: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn make_symlink(target: &[u8], abs: &Path) -> Result<()> {
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;
    std::os::unix::fs::symlink(OsStr::from_bytes(target), abs).map_err(|e| Error::io(abs, e))
}

#[cfg(not(unix))]
fn make_symlink(_target: &[u8], abs: &Path) -> Result<()> {
    Err(Error::InvalidArgument(format!(
        "symlinks are not supported here: {}",
        abs.display()
    )))
}
