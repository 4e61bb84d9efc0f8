//! Mirroring between live directories and pointers
//!
//! This crate provides:
//! - The database handle shared by every controller
//! - The apply-to-filesystem primitive with symlink containment
//! - Checkout and reset of snapshots on disk
//! - Mirrors that advance a pointer as a directory changes
//! - Checkout mirrors that keep a directory at a pointer's head
//! - A transport-neutral service over all of the above

pub mod apply;
pub mod checkout;
pub mod db;
pub mod follow;
pub mod heatmap;
pub mod mirror;
pub mod service;

pub use apply::{check_symlink, FsApplier};
pub use checkout::{checkout, reset_checkout, CheckoutStatus};
pub use db::Db;
pub use follow::CheckoutMirrors;
pub use heatmap::Heatmap;
pub use mirror::{Mirror, MirrorSpec, MirrorStatus, Mirrors, PointerStatus};
pub use service::{
    CheckoutRequest, FollowRequest, MirrorStartRequest, Service, ServiceResult, SnapshotDirRequest,
    Status, StatusCode,
};
