//! Which paths changed between two snapshots, and edit history queries
//!
//! The incremental walk follows `Edit` recipes back from the newer snapshot
//! until it meets the older one. It gives up on anything it cannot account
//! for path by path (content IDs, non-edit paths, `rmdir`, multi-input ops),
//! and the caller then diffs fully materialized trees instead.

use crate::graph::{Descent, Step, Visitor};
use crate::materialize::{touches, MaterializeOptions, Materializer};
use snap_core::{Op, PathMatcher, RecipeStore, RecipeTag, Result, SnapshotId, TreeDiff};
use std::collections::BTreeSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Clone)]
struct EditedPaths {
    start: SnapshotId,
    matcher: PathMatcher,
    read_tag: RecipeTag,
}

impl EditedPaths {
    fn accountable(step: &Step) -> bool {
        step.tag.is_edit()
            && step.recipe.inputs.len() <= 1
            && step.recipe.op.is_file_op()
            && !matches!(step.recipe.op, Op::Rmdir { .. })
    }
}

impl Visitor for EditedPaths {
    /// `None` once the walk can no longer account for every change
    type Value = Option<BTreeSet<String>>;

    fn empty(&self) -> Result<Self::Value> {
        Ok(self.start.is_empty().then(BTreeSet::new))
    }

    fn visit_node(&self, id: &SnapshotId) -> Result<Option<Self::Value>> {
        if *id == self.start {
            return Ok(Some(Some(BTreeSet::new())));
        }
        if id.is_content() {
            return Ok(Some(None));
        }
        Ok(None)
    }

    fn visit_backwards(&self, step: &Step, _input: &SnapshotId, _index: usize) -> Result<Descent<Self>> {
        if !Self::accountable(step) {
            return Ok(Descent::Value(None));
        }
        Ok(Descent::Visit(self.clone()))
    }

    fn apply_op(&self, step: &Step, mut inputs: Vec<Self::Value>) -> Result<Self::Value> {
        if !Self::accountable(step) {
            return Ok(None);
        }
        let below = match inputs.pop() {
            Some(value) => value,
            None => self.empty()?,
        };
        Ok(below.map(|mut set| {
            if let Some(p) = step.recipe.op.path() {
                if self.matcher.matches(p) {
                    set.insert(p.to_string());
                }
            }
            set
        }))
    }

    fn read_tag(&self) -> RecipeTag {
        self.read_tag.clone()
    }
}

/// First edit tag recorded for `id`
async fn edit_tag(store: &dyn RecipeStore, id: &SnapshotId) -> Result<Option<RecipeTag>> {
    if id.is_empty() || id.is_content() {
        return Ok(None);
    }
    Ok(store
        .paths(id)
        .await?
        .into_iter()
        .map(|p| p.tag)
        .find(RecipeTag::is_edit))
}

/// Matched file paths that differ between `from` and `to`
pub async fn paths_changed(
    materializer: &Materializer,
    from: &SnapshotId,
    to: &SnapshotId,
    matcher: &PathMatcher,
    cancel: &CancellationToken,
) -> Result<BTreeSet<String>> {
    if from == to {
        return Ok(BTreeSet::new());
    }

    if !from.is_content() {
        if let Some(read_tag) = edit_tag(materializer.store().as_ref(), to).await? {
            let visitor = EditedPaths {
                start: from.clone(),
                matcher: matcher.clone(),
                read_tag,
            };
            if let Some(paths) = materializer.evaluator().evaluate(visitor, to, cancel).await? {
                return Ok(paths);
            }
            debug!(from = %from, to = %to, "incremental walk incomplete, diffing trees");
        }
    }

    let opts = MaterializeOptions::with_matcher(matcher.clone());
    let (old, new) = futures::try_join!(
        materializer.materialize(from, &opts, cancel),
        materializer.materialize(to, &opts, cancel),
    )?;
    Ok(TreeDiff::diff(&old, &new).changed_paths())
}

#[derive(Clone)]
struct AncestorList {
    matcher: PathMatcher,
    read_tag: RecipeTag,
}

impl AncestorList {
    fn follows(step: &Step) -> bool {
        step.recipe.inputs.len() <= 1
            && (step.recipe.op.is_file_op() || step.recipe.op == Op::Identity)
    }
}

impl Visitor for AncestorList {
    /// Oldest first
    type Value = Vec<SnapshotId>;

    fn empty(&self) -> Result<Self::Value> {
        Ok(Vec::new())
    }

    fn visit_node(&self, id: &SnapshotId) -> Result<Option<Self::Value>> {
        Ok(id.is_content().then(Vec::new))
    }

    fn visit_backwards(&self, step: &Step, _input: &SnapshotId, _index: usize) -> Result<Descent<Self>> {
        if Self::follows(step) {
            Ok(Descent::Visit(self.clone()))
        } else {
            Ok(Descent::Value(Vec::new()))
        }
    }

    fn apply_op(&self, step: &Step, mut inputs: Vec<Self::Value>) -> Result<Self::Value> {
        if !Self::follows(step) {
            return Ok(Vec::new());
        }
        let mut ids = inputs.pop().unwrap_or_default();
        if let Some(p) = step.recipe.op.path() {
            if touches(&self.matcher, p) {
                ids.push(step.id.clone());
            }
        }
        Ok(ids)
    }

    fn read_tag(&self) -> RecipeTag {
        self.read_tag.clone()
    }
}

/// Snapshots along `id`'s linear history whose op edited a matched path,
/// newest first
pub async fn edited_ancestors(
    materializer: &Materializer,
    id: &SnapshotId,
    matcher: &PathMatcher,
    read_tag: RecipeTag,
    limit: usize,
    cancel: &CancellationToken,
) -> Result<Vec<SnapshotId>> {
    let visitor = AncestorList {
        matcher: matcher.clone(),
        read_tag,
    };
    let mut ids = materializer.evaluator().evaluate(visitor, id, cancel).await?;
    ids.reverse();
    ids.truncate(limit);
    Ok(ids)
}

/// The linear ops leading from `from` to `to`, oldest first
///
/// Returns `None` when `to` does not descend from `from` through at most
/// `limit` single-input file ops.
pub async fn recipes_between(
    store: &dyn RecipeStore,
    from: &SnapshotId,
    to: &SnapshotId,
    read_tag: &RecipeTag,
    limit: usize,
) -> Result<Option<Vec<Op>>> {
    let mut ops = Vec::new();
    let mut current = to.clone();
    while current != *from {
        if current.is_empty() || ops.len() >= limit {
            return Ok(None);
        }
        let stored = store.lookup(&current, read_tag).await?;
        let input = match stored.recipe.single_input() {
            Some(input) => input.clone(),
            None => return Ok(None),
        };
        match stored.recipe.op {
            Op::Identity => {}
            op if op.is_file_op() => ops.push(op),
            _ => return Ok(None),
        }
        current = input;
    }
    ops.reverse();
    Ok(Some(ops))
}

#[cfg(test)]
mod tests {
    use super::*;
    use snap_core::{MemoryRecipeStore, OwnerId, PointerId, PointerKind, Recipe, StoredRecipe};
    use std::sync::Arc;

    fn edit_tag() -> RecipeTag {
        RecipeTag::Edit(PointerId::new(OwnerId(3), "main", PointerKind::Workspace).unwrap())
    }

    async fn push(store: &MemoryRecipeStore, base: &SnapshotId, op: Op, tag: RecipeTag) -> SnapshotId {
        store
            .create(Recipe::on(op, base.clone()), Some(OwnerId(3)), tag)
            .await
            .unwrap()
            .0
    }

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_write_then_edit_both_strategies() {
        for tag in [edit_tag(), RecipeTag::Temp] {
            let store = Arc::new(MemoryRecipeStore::new());
            let s1 = push(&store, &SnapshotId::Empty, Op::write("foo.txt", "foo"), tag.clone()).await;
            let s2 = push(&store, &s1, Op::write("bar.txt", "bar"), tag.clone()).await;
            let s3 = push(&store, &s2, Op::write("foo.txt", "foo2"), tag.clone()).await;

            let mat = Materializer::new(store);
            let cancel = CancellationToken::new();
            let all = PathMatcher::all();
            assert_eq!(paths_changed(&mat, &s2, &s3, &all, &cancel).await.unwrap(), set(&["foo.txt"]));
            assert_eq!(
                paths_changed(&mat, &SnapshotId::Empty, &s3, &all, &cancel).await.unwrap(),
                set(&["bar.txt", "foo.txt"])
            );
            assert!(paths_changed(&mat, &s3, &s3, &all, &cancel).await.unwrap().is_empty());

            let only_bar = PathMatcher::from_paths(["bar.txt"]);
            assert_eq!(
                paths_changed(&mat, &s1, &s3, &only_bar, &cancel).await.unwrap(),
                set(&["bar.txt"])
            );
        }
    }

    #[tokio::test]
    async fn test_incremental_falls_back_on_unrelated_start() {
        let store = Arc::new(MemoryRecipeStore::new());
        let tag = edit_tag();
        let a = push(&store, &SnapshotId::Empty, Op::write("x", "1"), tag.clone()).await;
        let b = push(&store, &SnapshotId::Empty, Op::write("x", "1"), tag.clone()).await;
        let b = push(&store, &b, Op::write("y", "2"), tag).await;

        // `a` is not on `b`'s chain; identical x must not be reported
        let mat = Materializer::new(store);
        let changed = paths_changed(&mat, &a, &b, &PathMatcher::all(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(changed, set(&["y"]));
    }

    #[tokio::test]
    async fn test_edited_ancestors() {
        let store = Arc::new(MemoryRecipeStore::new());
        let tag = edit_tag();
        let s1 = push(&store, &SnapshotId::Empty, Op::write("a", "1"), tag.clone()).await;
        let s2 = push(&store, &s1, Op::write("b", "1"), tag.clone()).await;
        let s3 = push(&store, &s2, Op::write("a", "2"), tag.clone()).await;
        let s4 = push(&store, &s3, Op::write("b", "2"), tag.clone()).await;

        let mat = Materializer::new(store);
        let cancel = CancellationToken::new();
        let ids = edited_ancestors(&mat, &s4, &PathMatcher::from_paths(["a"]), tag.clone(), 10, &cancel)
            .await
            .unwrap();
        assert_eq!(ids, vec![s3.clone(), s1]);

        let ids = edited_ancestors(&mat, &s4, &PathMatcher::all(), tag, 2, &cancel)
            .await
            .unwrap();
        assert_eq!(ids, vec![s4, s3]);
    }

    #[tokio::test]
    async fn test_recipes_between() {
        let store = Arc::new(MemoryRecipeStore::new());
        let tag = edit_tag();
        let s1 = push(&store, &SnapshotId::Empty, Op::write("a", "1"), tag.clone()).await;
        let s2 = push(&store, &s1, Op::write("b", "1"), tag.clone()).await;
        let s3 = push(&store, &s2, Op::remove("a"), tag.clone()).await;

        let ops = recipes_between(store.as_ref(), &s1, &s3, &tag, 10).await.unwrap();
        assert_eq!(ops, Some(vec![Op::write("b", "1"), Op::remove("a")]));

        let ops = recipes_between(store.as_ref(), &SnapshotId::Empty, &s3, &tag, 10).await.unwrap();
        assert_eq!(ops.map(|o| o.len()), Some(3));

        assert_eq!(recipes_between(store.as_ref(), &s1, &s3, &tag, 1).await.unwrap(), None);
        assert_eq!(recipes_between(store.as_ref(), &s3, &s1, &tag, 10).await.unwrap(), None);

        // An optimized snapshot is still walked along its edit path
        let (content, _) = store
            .create(
                Recipe::leaf(Op::WriteFile {
                    path: String::new(),
                    data: "1".into(),
                    executable: false,
                    file_type: Default::default(),
                }),
                Some(OwnerId(3)),
                RecipeTag::Optimal,
            )
            .await
            .unwrap();
        store
            .create_path(StoredRecipe::new(s2.clone(), RecipeTag::Optimal, Recipe::identity(content)))
            .await
            .unwrap();
        let ops = recipes_between(store.as_ref(), &s1, &s3, &tag, 10).await.unwrap();
        assert_eq!(ops.map(|o| o.len()), Some(2));
    }
}
