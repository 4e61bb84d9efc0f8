//! Transport-neutral request/reply surface over the database, mirrors and
//! checkouts

use crate::checkout::{checkout, reset_checkout, CheckoutStatus};
use crate::db::Db;
use crate::follow::CheckoutMirrors;
use crate::mirror::{MirrorSpec, MirrorStatus, Mirrors, PointerStatus};
use serde::{Deserialize, Serialize};
use snap_core::{Error, PathMatcher, PointerId, SnapshotId};
use snap_journal::PointerAtSnapshot;
use snap_watcher::snapshot_dir;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

/// Coarse outcome class a transport reports for an error
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    NotFound,
    InvalidArgument,
    FailedPrecondition,
    ResourceExhausted,
    Canceled,
    DeadlineExceeded,
    Internal,
}

impl From<&Error> for StatusCode {
    fn from(e: &Error) -> Self {
        match e {
            Error::NotFound(_) => StatusCode::NotFound,
            Error::SymlinkEscape { .. }
            | Error::InvalidArgument(_)
            | Error::InvalidTarget(_)
            | Error::TempWrite(_) => StatusCode::InvalidArgument,
            Error::StaleWrite { .. } | Error::FrozenWrite(_) | Error::Conflict { .. } => {
                StatusCode::FailedPrecondition
            }
            Error::TooManyWrites { .. } | Error::TooManyFiles { .. } | Error::ResourceExhausted(_) => {
                StatusCode::ResourceExhausted
            }
            Error::Canceled => StatusCode::Canceled,
            Error::DeadlineExceeded => StatusCode::DeadlineExceeded,
            Error::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound => {
                StatusCode::NotFound
            }
            _ => StatusCode::Internal,
        }
    }
}

/// Error as seen by a service caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub code: StatusCode,
    pub message: String,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for Status {}

impl From<Error> for Status {
    fn from(e: Error) -> Self {
        Status {
            code: StatusCode::from(&e),
            message: e.to_string(),
        }
    }
}

pub type ServiceResult<T> = std::result::Result<T, Status>;

fn absolute(path: &Path) -> ServiceResult<()> {
    if path.is_absolute() {
        Ok(())
    } else {
        Err(Error::InvalidArgument(format!("{} is not an absolute path", path.display())).into())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutRequest {
    pub snapshot: SnapshotId,
    /// Empty for a fresh temporary directory
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotDirRequest {
    pub path: PathBuf,
    pub matcher: PathMatcher,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorStartRequest {
    pub pointer: PointerId,
    pub path: PathBuf,
    pub matcher: PathMatcher,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowRequest {
    pub pointer: PointerId,
    pub path: PathBuf,
}

/// Every operation exposed to a transport
pub struct Service {
    db: Db,
    mirrors: Mirrors,
    checkouts: CheckoutMirrors,
    cancel: CancellationToken,
}

impl Service {
    pub fn new(db: Db) -> Self {
        Self {
            mirrors: Mirrors::new(db.clone()),
            checkouts: CheckoutMirrors::new(db.clone()),
            db,
            cancel: CancellationToken::new(),
        }
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn mirrors(&self) -> &Mirrors {
        &self.mirrors
    }

    pub async fn checkout(&self, req: CheckoutRequest) -> ServiceResult<CheckoutStatus> {
        if !req.path.as_os_str().is_empty() {
            absolute(&req.path)?;
        }
        Ok(checkout(&self.db, &req.snapshot, &req.path, &self.cancel).await?)
    }

    pub async fn reset_checkout(&self, status: CheckoutStatus) -> ServiceResult<CheckoutStatus> {
        absolute(&status.root)?;
        Ok(reset_checkout(&self.db, &status, &self.cancel).await?)
    }

    pub async fn snapshot_dir(&self, req: SnapshotDirRequest) -> ServiceResult<SnapshotId> {
        absolute(&req.path)?;
        let id = snapshot_dir(
            self.db.store().clone(),
            &req.path,
            &req.matcher,
            self.db.owner(),
            &self.db.config().watcher,
        )
        .await?;
        Ok(id)
    }

    pub async fn fs2wm_start(&self, req: MirrorStartRequest) -> ServiceResult<MirrorStatus> {
        absolute(&req.path)?;
        let spec = MirrorSpec::new(req.pointer, req.path).with_matcher(req.matcher);
        Ok(self.mirrors.start(spec).await?)
    }

    pub async fn fs2wm_stop(&self, pointer: &PointerId) -> ServiceResult<()> {
        Ok(self.mirrors.stop(pointer).await?)
    }

    pub fn fs2wm_status(&self) -> Vec<MirrorStatus> {
        self.mirrors.status()
    }

    pub async fn fs2wm_pointer_status(&self, pointer: &PointerId) -> ServiceResult<PointerStatus> {
        Ok(self.mirrors.pointer_status(pointer).await?)
    }

    pub async fn fs2wm_fsync(&self, pointer: &PointerId, token: &str) -> ServiceResult<PointerAtSnapshot> {
        Ok(self.mirrors.fsync(pointer, token).await?)
    }

    pub async fn wm2fs_start(&self, req: FollowRequest) -> ServiceResult<()> {
        absolute(&req.path)?;
        Ok(self.checkouts.start(&req.pointer, &req.path).await?)
    }

    pub async fn wm2fs_stop(&self, path: &Path) -> ServiceResult<()> {
        absolute(path)?;
        Ok(self.checkouts.stop(path).await?)
    }

    /// Stop every mirror and checkout mirror
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.mirrors.shutdown().await;
        self.checkouts.shutdown().await;
    }
}
