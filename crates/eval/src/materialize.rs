//! Snapshot materializer: evaluates a snapshot ID into a [`Tree`]
//!
//! Evaluation is pruned by the requested matcher. Linear ops on paths the
//! matcher cannot see are skipped, `dir` inputs holding nothing selected are
//! never visited, and an op that fully determines the single file being read
//! stops the walk.

use crate::graph::{Descent, Evaluator, Step, Visitor};
use dashmap::DashMap;
use parking_lot::Mutex;
use snap_core::{
    path, ApplyMode, FileNode, Op, PathMatcher, RecipeStore, RecipeTag, Result, SnapshotId, Tree,
};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

/// What to materialize and how
#[derive(Debug, Clone)]
pub struct MaterializeOptions {
    pub matcher: PathMatcher,
    /// Keep every file's bytes empty
    pub strip_contents: bool,
    pub read_tag: RecipeTag,
}

impl Default for MaterializeOptions {
    fn default() -> Self {
        Self {
            matcher: PathMatcher::all(),
            strip_contents: false,
            read_tag: RecipeTag::Optimal,
        }
    }
}

impl MaterializeOptions {
    pub fn with_matcher(matcher: PathMatcher) -> Self {
        Self {
            matcher,
            ..Self::default()
        }
    }
}

/// Matcher to evaluate input `index` of `op` with
///
/// Returns `None` when nothing `matcher` selects can come from that input.
pub(crate) fn input_matcher(matcher: &PathMatcher, op: &Op, index: usize) -> Option<PathMatcher> {
    match op {
        Op::Subdir { path: sub } => Some(matcher.subdir(sub)),
        Op::Dir { names } => {
            let child = matcher.child(names.get(index)?);
            (!child.is_empty()).then_some(child)
        }
        Op::Preserve { matcher: keep, .. } if matcher.is_all() => Some(keep.clone()),
        _ => Some(matcher.clone()),
    }
}

/// Whether an op at `op_path` can change anything `matcher` selects
pub(crate) fn touches(matcher: &PathMatcher, op_path: &str) -> bool {
    op_path.is_empty()
        || matcher.matches(op_path)
        || !matcher.child(op_path).is_empty()
        || path::ancestors(op_path).any(|a| matcher.matches(a))
}

/// Whether `op` alone decides everything `matcher` selects
pub(crate) fn determines(matcher: &PathMatcher, op: &Op) -> bool {
    match op {
        Op::WriteFile { path: p, .. } | Op::RemoveFile { path: p } | Op::Rmdir { path: p }
            if p.is_empty() =>
        {
            true
        }
        Op::WriteFile { path: p, .. } | Op::RemoveFile { path: p } => {
            matcher.single_file().as_deref() == Some(p.as_str())
        }
        _ => false,
    }
}

/// Content subtrees shared across evaluations, oldest dropped first
struct TreeCache {
    entries: DashMap<SnapshotId, Tree>,
    order: Mutex<VecDeque<SnapshotId>>,
    capacity: usize,
}

impl TreeCache {
    fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    fn get(&self, id: &SnapshotId) -> Option<Tree> {
        self.entries.get(id).map(|t| t.clone())
    }

    fn insert(&self, id: SnapshotId, tree: Tree) {
        if self.capacity == 0 {
            return;
        }
        let mut order = self.order.lock();
        if self.entries.insert(id.clone(), tree).is_some() {
            return;
        }
        order.push_back(id);
        while order.len() > self.capacity {
            if let Some(oldest) = order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn clear(&self) {
        let mut order = self.order.lock();
        order.clear();
        self.entries.clear();
    }
}

#[derive(Clone)]
struct TreeVisitor {
    matcher: PathMatcher,
    strip_contents: bool,
    read_tag: RecipeTag,
    cache: Arc<TreeCache>,
}

impl TreeVisitor {
    fn descend(&self, matcher: PathMatcher) -> Self {
        Self {
            matcher,
            ..self.clone()
        }
    }

    /// Full, unstripped trees of content IDs are shared across evaluations
    fn cacheable(&self, id: &SnapshotId) -> bool {
        id.is_content() && self.matcher.is_all() && !self.strip_contents
    }
}

impl Visitor for TreeVisitor {
    type Value = Tree;

    fn empty(&self) -> Result<Tree> {
        Ok(Tree::empty())
    }

    fn visit_node(&self, id: &SnapshotId) -> Result<Option<Tree>> {
        if !self.cacheable(id) {
            return Ok(None);
        }
        Ok(self.cache.get(id))
    }

    fn visit_backwards(&self, step: &Step, _input: &SnapshotId, index: usize) -> Result<Descent<Self>> {
        let op = &step.recipe.op;
        if determines(&self.matcher, op) {
            return Ok(Descent::Empty);
        }
        match input_matcher(&self.matcher, op, index) {
            Some(m) if m == self.matcher => Ok(Descent::Visit(self.clone())),
            Some(m) => Ok(Descent::Visit(self.descend(m))),
            None => Ok(Descent::Empty),
        }
    }

    fn apply_op(&self, step: &Step, mut inputs: Vec<Tree>) -> Result<Tree> {
        let op = &step.recipe.op;
        let mut tree = match op {
            Op::Dir { names } => {
                let mut kept_names = Vec::with_capacity(names.len());
                let mut kept_inputs = Vec::with_capacity(names.len());
                for (index, (name, input)) in names.iter().zip(inputs).enumerate() {
                    if input_matcher(&self.matcher, op, index).is_some() {
                        kept_names.push(name.clone());
                        kept_inputs.push(input);
                    }
                }
                Tree::from_dir(&kept_names, kept_inputs)?
            }
            Op::Overlay => inputs
                .into_iter()
                .reduce(Tree::overlay)
                .unwrap_or_else(Tree::empty),
            _ => {
                let mut tree = inputs.pop().unwrap_or_else(Tree::empty);
                if let Some(op_path) = op.path() {
                    if !touches(&self.matcher, op_path) {
                        return Ok(tree);
                    }
                }
                let mode = ApplyMode {
                    strip_contents: self.strip_contents,
                    lenient: !self.matcher.is_all(),
                };
                tree.apply_linear(op, mode)?;
                tree
            }
        };

        if self.cacheable(&step.id) {
            tree.set_content_id(step.id.clone());
            self.cache.insert(step.id.clone(), tree.clone());
        }
        Ok(tree)
    }

    fn read_tag(&self) -> RecipeTag {
        self.read_tag.clone()
    }
}

/// Content subtrees a [`Materializer`] keeps by default
pub const DEFAULT_CACHE_ENTRIES: usize = 4096;

/// Evaluates snapshot IDs into trees, sharing a cache of content subtrees
#[derive(Clone)]
pub struct Materializer {
    evaluator: Evaluator,
    cache: Arc<TreeCache>,
}

impl Materializer {
    pub fn new(store: Arc<dyn RecipeStore>) -> Self {
        Self::with_cache_entries(store, DEFAULT_CACHE_ENTRIES)
    }

    /// Keep at most `entries` subtrees cached; 0 disables the cache
    pub fn with_cache_entries(store: Arc<dyn RecipeStore>, entries: usize) -> Self {
        Self {
            evaluator: Evaluator::new(store),
            cache: Arc::new(TreeCache::new(entries)),
        }
    }

    pub fn store(&self) -> &Arc<dyn RecipeStore> {
        self.evaluator.store()
    }

    pub fn evaluator(&self) -> &Evaluator {
        &self.evaluator
    }

    /// Materialize `id`, keeping only what `opts.matcher` selects
    #[instrument(skip(self, opts, cancel), fields(id = %id))]
    pub async fn materialize(
        &self,
        id: &SnapshotId,
        opts: &MaterializeOptions,
        cancel: &CancellationToken,
    ) -> Result<Tree> {
        let visitor = TreeVisitor {
            matcher: opts.matcher.clone(),
            strip_contents: opts.strip_contents,
            read_tag: opts.read_tag.clone(),
            cache: self.cache.clone(),
        };
        let tree = self.evaluator.evaluate(visitor, id, cancel).await?;
        debug!(files = tree.len(), "materialized");
        Ok(tree.filter(&opts.matcher, opts.strip_contents))
    }

    /// Materialize every file of `id`
    pub async fn materialize_all(&self, id: &SnapshotId, cancel: &CancellationToken) -> Result<Tree> {
        self.materialize(id, &MaterializeOptions::default(), cancel).await
    }

    /// Read one file of `id`
    pub async fn read_file(
        &self,
        id: &SnapshotId,
        file_path: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<FileNode>> {
        let opts = MaterializeOptions::with_matcher(PathMatcher::from_paths([file_path]));
        let tree = self.materialize(id, &opts, cancel).await?;
        Ok(tree.get_file(file_path).cloned())
    }

    /// Number of content subtrees held in the cache
    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }
}
