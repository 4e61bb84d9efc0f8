//! Runtime configuration for the watcher, mirror and optimizer
//!
//! Loaded from TOML. Every section and field is optional and falls back to
//! its default.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Complete configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub mirror: MirrorConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
}

/// Filesystem watcher settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// Scans finding more files than this fail (default: 1_048_576)
    #[serde(default = "default_max_files_watched")]
    pub max_files_watched: usize,

    /// Check OS watch limits before starting (default: true)
    #[serde(default = "default_true")]
    pub limit_checks_enabled: bool,

    /// Window in which events for one path fold together (default: 1ms)
    #[serde(default = "default_coalesce_window_ms")]
    pub coalesce_window_ms: u64,

    /// Most events folded into one (default: 10)
    #[serde(default = "default_max_coalesce")]
    pub max_coalesce: usize,

    /// Parent directory for sync-cookie directories (default: system temp dir)
    #[serde(default)]
    pub cookie_dir: Option<PathBuf>,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            max_files_watched: default_max_files_watched(),
            limit_checks_enabled: true,
            coalesce_window_ms: default_coalesce_window_ms(),
            max_coalesce: default_max_coalesce(),
            cookie_dir: None,
        }
    }
}

impl WatcherConfig {
    pub fn coalesce_window(&self) -> Duration {
        Duration::from_millis(self.coalesce_window_ms)
    }
}

/// Mirror controller settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorConfig {
    /// Writes to one file tolerated per window (default: 5)
    #[serde(default = "default_mirror_write_limit")]
    pub mirror_write_limit: u32,

    /// Length of the write-count window in seconds (default: 5)
    #[serde(default = "default_write_window_secs")]
    pub write_window_secs: u64,

    /// Snapshot the directory before diffing against the pointer (default: true)
    #[serde(default = "default_true")]
    pub preemptive_optimize: bool,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            mirror_write_limit: default_mirror_write_limit(),
            write_window_secs: default_write_window_secs(),
            preemptive_optimize: true,
        }
    }
}

impl MirrorConfig {
    pub fn write_window(&self) -> Duration {
        Duration::from_secs(self.write_window_secs)
    }
}

/// Optimizer and rewriter settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// Ops the fast path walks back before giving up (default: 500)
    #[serde(default = "default_max_fast_path_search")]
    pub max_fast_path_search: usize,

    /// Recursion cap for the rewriting creator (default: 50)
    #[serde(default = "default_max_rewrite_height")]
    pub max_rewrite_height: usize,

    /// Record operational-transform rewrites as snapshots are created
    #[serde(default)]
    pub rewrite_on_create: bool,

    /// Materialized subtrees kept in memory, 0 to disable (default: 4096)
    #[serde(default = "default_materializer_cache_entries")]
    pub materializer_cache_entries: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            max_fast_path_search: default_max_fast_path_search(),
            max_rewrite_height: default_max_rewrite_height(),
            rewrite_on_create: false,
            materializer_cache_entries: default_materializer_cache_entries(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_files_watched() -> usize {
    1_048_576
}

fn default_coalesce_window_ms() -> u64 {
    1
}

fn default_max_coalesce() -> usize {
    10
}

fn default_mirror_write_limit() -> u32 {
    5
}

fn default_write_window_secs() -> u64 {
    5
}

fn default_max_fast_path_search() -> usize {
    500
}

fn default_max_rewrite_height() -> usize {
    50
}

fn default_materializer_cache_entries() -> usize {
    4096
}

impl Config {
    /// Parse and validate TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_toml_str(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(Error::io(path, e)),
        }
    }

    /// Render as TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Codec(e.to_string()))
    }

    /// Reject values outside their usable ranges
    pub fn validate(&self) -> Result<()> {
        if self.watcher.max_files_watched == 0 {
            return Err(Error::InvalidArgument(
                "watcher.max_files_watched must be at least 1".into(),
            ));
        }
        if self.watcher.max_coalesce == 0 {
            return Err(Error::InvalidArgument(
                "watcher.max_coalesce must be at least 1".into(),
            ));
        }
        if self.watcher.coalesce_window_ms > 1000 {
            return Err(Error::InvalidArgument(
                "watcher.coalesce_window_ms must be 0-1000".into(),
            ));
        }
        if self.mirror.mirror_write_limit == 0 {
            return Err(Error::InvalidArgument(
                "mirror.mirror_write_limit must be at least 1".into(),
            ));
        }
        if !(1..=3600).contains(&self.mirror.write_window_secs) {
            return Err(Error::InvalidArgument(
                "mirror.write_window_secs must be 1-3600".into(),
            ));
        }
        if self.optimizer.max_rewrite_height == 0 {
            return Err(Error::InvalidArgument(
                "optimizer.max_rewrite_height must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
