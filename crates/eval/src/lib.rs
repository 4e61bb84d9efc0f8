//! Recipe evaluation for snapmirror
//!
//! This crate provides:
//! - A generic backwards/forwards walk over recipe graphs
//! - Materialization of snapshots into trees, with matcher pruning
//! - Cost estimation and changed-path queries between snapshots
//! - The optimizer that turns edit chains into content-addressed snapshots
//! - Operational transforms and the rewriting recipe store built on them

pub mod cost;
pub mod graph;
pub mod materialize;
pub mod optimize;
pub mod paths_changed;
pub mod rewrite;
pub mod transform;

pub use cost::{cost, Cost};
pub use graph::{Descent, Evaluator, Step, Visitor};
pub use materialize::{MaterializeOptions, Materializer};
pub use optimize::{DirAssembler, Optimizer};
pub use paths_changed::{edited_ancestors, paths_changed, recipes_between};
pub use rewrite::RewritingStore;
pub use transform::transform;
