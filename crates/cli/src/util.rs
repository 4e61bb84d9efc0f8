//! Shared utilities for CLI commands

use anyhow::{Context, Result};
use snap_core::{Config, OwnerId, PathMatcher, SnapshotId};
use std::path::{Path, PathBuf};

/// Owner every snapshot made by the CLI is minted for
pub const CLI_OWNER: OwnerId = OwnerId(1);

/// Default config location: `<config_dir>/snapmirror/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("snapmirror").join("config.toml"))
}

/// Load the configuration
///
/// An explicit path must exist. The default location is optional and falls
/// back to the built-in defaults.
pub fn load_config(explicit: Option<&Path>) -> Result<(Config, Option<PathBuf>)> {
    match explicit {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            let config = Config::from_toml_str(&text)
                .with_context(|| format!("Invalid config file {}", path.display()))?;
            Ok((config, Some(path.to_path_buf())))
        }
        None => {
            let path = config_file_path();
            let config = match &path {
                Some(path) => Config::load(path)
                    .with_context(|| format!("Invalid config file {}", path.display()))?,
                None => Config::default(),
            };
            Ok((config, path))
        }
    }
}

/// Resolve an existing directory to an absolute, canonical path
pub fn existing_dir(path: &Path) -> Result<PathBuf> {
    let abs = path
        .canonicalize()
        .with_context(|| format!("Directory not found: {}", path.display()))?;
    if !abs.is_dir() {
        anyhow::bail!("Not a directory: {}", path.display());
    }
    Ok(abs)
}

/// Like [`existing_dir`], creating the directory first when it is missing
pub fn ensure_dir(path: &Path) -> Result<PathBuf> {
    if !path.exists() {
        std::fs::create_dir_all(path)
            .with_context(|| format!("Failed to create directory {}", path.display()))?;
    }
    existing_dir(path)
}

/// Matcher from `--include` patterns; none means every path
pub fn matcher_from(patterns: &[String]) -> Result<PathMatcher> {
    if patterns.is_empty() {
        return Ok(PathMatcher::all());
    }
    PathMatcher::new(patterns.iter()).context("Invalid --include pattern")
}

/// Shorten a snapshot ID for display, keeping the kind prefix
pub fn short_id(id: &SnapshotId) -> String {
    let full = id.to_string();
    match full.split_once('$') {
        Some((_, rest)) if rest.len() > 19 => format!("{}…", &rest[..19]),
        Some((_, rest)) => rest.to_string(),
        None => full,
    }
}
