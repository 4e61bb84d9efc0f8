//! Error kinds shared by every snapmirror crate

use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Result alias used throughout the library crates
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the snapshot database, evaluator, watcher and mirrors.
///
/// The enum is `Clone` so one terminal error can be handed to every caller
/// waiting on a watcher or mirror loop.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("stale write to pointer {pointer}: {reason}")]
    StaleWrite { pointer: String, reason: String },

    #[error("pointer {0} is frozen")]
    FrozenWrite(String),

    #[error("invalid target: {0}")]
    InvalidTarget(String),

    #[error("temp snapshot {0} cannot be written as a path")]
    TempWrite(String),

    #[error("playback failure: {0}")]
    Playback(String),

    #[error("symlink {path} points outside the checkout root (target {target})")]
    SymlinkEscape { path: String, target: String },

    #[error("too many writes to {path}: {count} writes inside one window")]
    TooManyWrites { path: String, count: u32 },

    #[error("too many files to watch: found more than {limit}")]
    TooManyFiles { limit: usize },

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("operation canceled")]
    Canceled,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("no transform exists for {0}")]
    NoTransform(String),

    #[error("conflicting recipe for {id} under tag {tag}")]
    Conflict { id: String, tag: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("i/o error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: Arc<std::io::Error>,
    },

    #[error("codec error: {0}")]
    Codec(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Wrap an I/O error together with the path it happened at
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source: Arc::new(source),
        }
    }

    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Error::NotFound(what.to_string())
    }

    pub fn playback(what: impl std::fmt::Display) -> Self {
        Error::Playback(what.to_string())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// True for both cancellation and deadline expiry
    pub fn is_canceled(&self) -> bool {
        matches!(self, Error::Canceled | Error::DeadlineExceeded)
    }

    /// True when the I/O error underneath is `ErrorKind::NotFound`
    pub fn is_io_not_found(&self) -> bool {
        match self {
            Error::Io { source, .. } => source.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(value: bincode::Error) -> Self {
        Error::Codec(value.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(value: toml::de::Error) -> Self {
        Error::InvalidArgument(format!("invalid configuration: {}", value))
    }
}
