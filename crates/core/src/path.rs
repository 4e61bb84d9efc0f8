//! Helpers for the slash-separated relative paths used inside snapshots
//!
//! The root of a snapshot is the empty string. Paths never start or end
//! with `/` and never contain `.` or `..` components.

use crate::error::{Error, Result};
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};

/// Reject paths that are absolute, contain empty/`.`/`..` components or NULs
pub fn validate(path: &str) -> Result<()> {
    if path.is_empty() {
        return Ok(());
    }
    for component in path.split('/') {
        if component.is_empty() || component == "." || component == ".." || component.contains('\0') {
            return Err(Error::InvalidArgument(format!("invalid snapshot path {:?}", path)));
        }
    }
    Ok(())
}

/// Iterate the components of a path (nothing for the root)
pub fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty())
}

/// Join a prefix and a relative path
pub fn join(prefix: &str, name: &str) -> String {
    match (prefix.is_empty(), name.is_empty()) {
        (true, _) => name.to_string(),
        (_, true) => prefix.to_string(),
        _ => format!("{}/{}", prefix, name),
    }
}

/// Split into (parent, file name); the root has no parent
pub fn split_last(path: &str) -> Option<(&str, &str)> {
    if path.is_empty() {
        return None;
    }
    Some(path.rsplit_once('/').unwrap_or(("", path)))
}

/// True when `path` equals `prefix` or lives underneath it
pub fn is_within(path: &str, prefix: &str) -> bool {
    prefix.is_empty()
        || path == prefix
        || (path.len() > prefix.len() && path.starts_with(prefix) && path.as_bytes()[prefix.len()] == b'/')
}

/// Strip `prefix/` from `path`, returning the remainder
pub fn strip_prefix<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    if prefix.is_empty() {
        return Some(path);
    }
    if path == prefix {
        return Some("");
    }
    path.strip_prefix(prefix)?.strip_prefix('/')
}

/// Every strict ancestor of a path, shortest first (excluding the root)
pub fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    path.match_indices('/').map(move |(i, _)| &path[..i])
}

/// First code point of the escape range; byte `b` maps to `ESCAPE_BASE + b`
const ESCAPE_BASE: u32 = 0x10_FF00;

fn escape_byte(byte: u8) -> char {
    char::from_u32(ESCAPE_BASE + u32::from(byte)).unwrap_or(char::REPLACEMENT_CHARACTER)
}

fn is_escape(c: char) -> bool {
    (ESCAPE_BASE + 0x80..=ESCAPE_BASE + 0xFF).contains(&u32::from(c))
}

/// Encode raw file name bytes as a snapshot path component
///
/// Valid UTF-8 passes through. Bytes that are not valid UTF-8 become code
/// points in U+10FF80..=U+10FFFF, and names that already contain such code
/// points have them escaped byte by byte, so [`decode_name`] is exact.
pub fn encode_name(mut bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    loop {
        match std::str::from_utf8(bytes) {
            Ok(valid) => {
                push_valid(&mut out, valid);
                return out;
            }
            Err(e) => {
                let (valid, rest) = bytes.split_at(e.valid_up_to());
                // valid_up_to guarantees this prefix is UTF-8
                push_valid(&mut out, std::str::from_utf8(valid).unwrap_or_default());
                let bad = e.error_len().unwrap_or(rest.len());
                out.extend(rest[..bad].iter().copied().map(escape_byte));
                bytes = &rest[bad..];
            }
        }
    }
}

fn push_valid(out: &mut String, valid: &str) {
    for c in valid.chars() {
        if is_escape(c) {
            let mut buf = [0u8; 4];
            out.extend(c.encode_utf8(&mut buf).bytes().map(escape_byte));
        } else {
            out.push(c);
        }
    }
}

/// Raw bytes of a component produced by [`encode_name`]
pub fn decode_name(name: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(name.len());
    for c in name.chars() {
        if is_escape(c) {
            out.push((u32::from(c) - ESCAPE_BASE) as u8);
        } else {
            let mut buf = [0u8; 4];
            out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
        }
    }
    out
}

/// Snapshot path component for an OS file name
#[cfg(unix)]
pub fn from_os_name(name: &OsStr) -> String {
    use std::os::unix::ffi::OsStrExt;
    encode_name(name.as_bytes())
}

#[cfg(not(unix))]
pub fn from_os_name(name: &OsStr) -> String {
    match name.to_str() {
        Some(text) => encode_name(text.as_bytes()),
        None => name.to_string_lossy().into_owned(),
    }
}

/// OS file name for a snapshot path component
#[cfg(unix)]
pub fn to_os_name(name: &str) -> OsString {
    use std::os::unix::ffi::OsStringExt;
    OsString::from_vec(decode_name(name))
}

#[cfg(not(unix))]
pub fn to_os_name(name: &str) -> OsString {
    OsString::from(String::from_utf8_lossy(&decode_name(name)).into_owned())
}

/// Filesystem location of a snapshot path below `root`
pub fn to_os_path(root: &Path, path: &str) -> PathBuf {
    let mut out = root.to_path_buf();
    for component in components(path) {
        out.push(to_os_name(component));
    }
    out
}
