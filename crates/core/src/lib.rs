//! Core data model for snapmirror
//!
//! This crate provides:
//! - Snapshot, owner and pointer identifiers with their persisted formats
//! - The closed set of recipe ops and the path matcher they use
//! - Recipes, their wire format and content-pure ID derivation
//! - The in-memory recipe store
//! - Tree values and the per-op semantics shared by every evaluator

pub mod config;
pub mod debug;
pub mod error;
pub mod hash;
pub mod id;
pub mod matcher;
pub mod op;
pub mod path;
pub mod recipe;
pub mod store;
pub mod tree;

pub use config::{Config, MirrorConfig, OptimizerConfig, WatcherConfig};
pub use error::{Error, Result};
pub use hash::{hash_bytes, ContentHash, IncrementalHasher};
pub use id::{
    CreatorKind, OwnerId, PointerId, PointerKind, RecipeTag, RewriteDirection, SnapshotId,
};
pub use matcher::PathMatcher;
pub use op::{apply_splices, FileType, Op, Splice, Splices};
pub use recipe::{file_content_hash, Recipe, StoredRecipe};
pub use store::{MemoryRecipeStore, RecipeStore};
pub use tree::{ApplyMode, DirNode, FileNode, Missing, Tree, TreeDiff};
