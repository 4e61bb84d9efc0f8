//! Pointer journal
//!
//! This crate provides:
//! - Pointer revision records
//! - The pointer store: append-only histories, freeze, temp pointers and
//!   one-shot change waiters
//! - Lazy newest-first history iteration

pub mod history;
pub mod journal;
pub mod pointer;

// Re-exports
pub use history::History;
pub use journal::{MemoryPointerStore, PointerStore};
pub use pointer::{now_ms, PointerAtSnapshot, PointerMeta, Revision};
