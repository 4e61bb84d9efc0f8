//! Common utilities for integration tests

pub mod cli;

use std::fs;
use std::path::Path;

/// Write `data` to `root/rel`, creating parent directories
pub fn write_file(root: &Path, rel: &str, data: &str) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, data).unwrap();
}
