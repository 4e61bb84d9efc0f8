//! Workflow integration tests
//!
//! Complete runs of one or more commands, checked on disk and in output.

pub mod config;
pub mod snapshot_copy;
