//! Optimizer: makes a snapshot addressable by a content ID
//!
//! The fast path walks a short linear edit history back to the closest
//! optimized ancestor and rebuilds only the directories the edits touched,
//! reusing every other subtree by its existing content ID. Anything else goes
//! through the slow path, which materializes the whole tree and assembles it
//! bottom up. Both produce the same canonical recipes, so both arrive at the
//! same content ID for the same tree.

use crate::materialize::{MaterializeOptions, Materializer};
use futures::future::{BoxFuture, FutureExt};
use snap_core::{
    Error, Op, OptimizerConfig, OwnerId, PathMatcher, Recipe, RecipeStore, RecipeTag, Result,
    SnapshotId, StoredRecipe, Tree,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

/// Emits canonical `writeFile("")` and sorted `dir` recipes for trees
#[derive(Clone)]
pub struct DirAssembler {
    store: Arc<dyn RecipeStore>,
    owner: OwnerId,
}

impl DirAssembler {
    pub fn new(store: Arc<dyn RecipeStore>, owner: OwnerId) -> Self {
        Self { store, owner }
    }

    fn reusable(&self, memo: Option<&SnapshotId>) -> Option<SnapshotId> {
        memo.filter(|id| id.is_content() && id.owner() == Some(self.owner))
            .cloned()
    }

    /// Content ID of `tree`; directories without files become the empty snapshot
    pub fn assemble<'a>(&'a self, tree: &'a Tree) -> BoxFuture<'a, Result<SnapshotId>> {
        async move {
            if let Some(id) = self.reusable(tree.content_id()) {
                return Ok(id);
            }
            match tree {
                Tree::File(file) => {
                    let recipe = Recipe::leaf(Op::WriteFile {
                        path: String::new(),
                        data: file.data.clone(),
                        executable: file.executable,
                        file_type: file.file_type,
                    });
                    self.create(recipe).await
                }
                Tree::Dir(dir) => {
                    let mut entries = Vec::with_capacity(dir.entries().len());
                    for (name, child) in dir.entries() {
                        let id = self.assemble(child).await?;
                        if !id.is_empty() {
                            entries.push((name.clone(), id));
                        }
                    }
                    self.dir(entries).await
                }
            }
        }
        .boxed()
    }

    /// Content ID of a directory holding `entries`, in any order
    pub async fn dir(&self, mut entries: Vec<(String, SnapshotId)>) -> Result<SnapshotId> {
        if entries.is_empty() {
            return Ok(SnapshotId::Empty);
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        let (names, inputs): (Vec<String>, Vec<SnapshotId>) = entries.into_iter().unzip();
        self.create(Recipe::new(Op::Dir { names }, inputs)).await
    }

    async fn create(&self, recipe: Recipe) -> Result<SnapshotId> {
        let (id, _) = self
            .store
            .create(recipe, Some(self.owner), RecipeTag::Optimal)
            .await?;
        if !id.is_content() && !id.is_empty() {
            return Err(Error::Internal(format!("assembled {} is not content-addressed", id)));
        }
        Ok(id)
    }
}

/// Rewrites snapshots into content-addressed form
#[derive(Clone)]
pub struct Optimizer {
    materializer: Materializer,
    config: OptimizerConfig,
}

impl Optimizer {
    pub fn new(materializer: Materializer, config: OptimizerConfig) -> Self {
        Self {
            materializer,
            config,
        }
    }

    fn store(&self) -> &Arc<dyn RecipeStore> {
        self.materializer.store()
    }

    /// The content ID `id` already resolves to, if it has been optimized
    pub async fn optimized(&self, id: &SnapshotId) -> Result<Option<SnapshotId>> {
        if id.is_empty() || id.is_content() {
            return Ok(Some(id.clone()));
        }
        let link = self.store().lookup_exact(id, &RecipeTag::Optimal).await?;
        Ok(link.and_then(|stored| match (stored.recipe.op, stored.recipe.inputs.as_slice()) {
            (Op::Identity, [target]) if target.is_content() || target.is_empty() => Some(target.clone()),
            _ => None,
        }))
    }

    /// Content ID with the same tree as `id`, linked from `id` when possible
    #[instrument(skip(self, cancel), fields(id = %id))]
    pub async fn optimize(&self, id: &SnapshotId, cancel: &CancellationToken) -> Result<SnapshotId> {
        if let Some(content) = self.optimized(id).await? {
            return Ok(content);
        }
        let owner = id
            .owner()
            .ok_or_else(|| Error::InvalidArgument(format!("{} has no owner", id)))?;

        let content = match self.fast_path(id, owner, cancel).await? {
            Some(content) => content,
            None => {
                debug!("taking slow path");
                let tree = self.materializer.materialize_all(id, cancel).await?;
                DirAssembler::new(self.store().clone(), owner)
                    .assemble(&tree)
                    .await?
            }
        };

        // Temp snapshots cannot carry extra paths
        if !id.is_temp() {
            let link = StoredRecipe::new(id.clone(), RecipeTag::Optimal, Recipe::identity(content.clone()));
            self.store().create_path(link).await?;
        }
        info!(content = %content, "optimized snapshot");
        Ok(content)
    }

    /// Rebuild from the closest optimized ancestor; `None` means not applicable
    async fn fast_path(
        &self,
        id: &SnapshotId,
        owner: OwnerId,
        cancel: &CancellationToken,
    ) -> Result<Option<SnapshotId>> {
        let mut touched = Vec::new();
        let mut current = id.clone();
        let base = loop {
            if cancel.is_cancelled() {
                return Err(Error::Canceled);
            }
            if let Some(content) = self.optimized(&current).await? {
                break content;
            }
            if touched.len() >= self.config.max_fast_path_search {
                debug!(limit = self.config.max_fast_path_search, "fast path search exhausted");
                return Ok(None);
            }
            let stored = self.store().lookup(&current, &RecipeTag::Optimal).await?;
            let input = match stored.recipe.single_input() {
                Some(input) => input.clone(),
                None => return Ok(None),
            };
            match &stored.recipe.op {
                Op::Identity => {}
                op if op.is_file_op() => match op.path() {
                    Some(p) if !p.is_empty() => touched.push(p.to_string()),
                    _ => return Ok(None),
                },
                _ => return Ok(None),
            }
            current = input;
        };

        if base.owner().map_or(false, |o| o != owner) {
            return Ok(None);
        }
        if touched.is_empty() {
            return Ok(Some(base));
        }
        touched.sort();
        touched.dedup();

        let opts = MaterializeOptions::with_matcher(PathMatcher::from_prefixes(&touched));
        let tree = self.materializer.materialize(id, &opts, cancel).await?;
        let relative: Vec<&str> = touched.iter().map(String::as_str).collect();
        let assembler = DirAssembler::new(self.store().clone(), owner);
        let rebuilt = self.rebuild(&assembler, base, Some(&tree), relative).await?;
        if rebuilt.is_some() {
            debug!(edits = touched.len(), "took fast path");
        }
        Ok(rebuilt)
    }

    /// Content ID for `current`, given its previous content ID `base` and the
    /// paths below it that may have changed
    fn rebuild<'a>(
        &'a self,
        assembler: &'a DirAssembler,
        base: SnapshotId,
        current: Option<&'a Tree>,
        touched: Vec<&'a str>,
    ) -> BoxFuture<'a, Result<Option<SnapshotId>>> {
        async move {
            let dir = match current {
                None => return Ok(Some(SnapshotId::Empty)),
                Some(node @ Tree::File(_)) => return assembler.assemble(node).await.map(Some),
                Some(node) if touched.contains(&"") => return assembler.assemble(node).await.map(Some),
                Some(Tree::Dir(dir)) => dir,
            };

            let mut entries: BTreeMap<String, SnapshotId> = BTreeMap::new();
            if !base.is_empty() {
                let stored = self.store().lookup(&base, &RecipeTag::Optimal).await?;
                match stored.recipe.op {
                    Op::Dir { names } => {
                        if names.iter().any(|n| n.contains('/')) {
                            return Ok(None);
                        }
                        entries.extend(names.into_iter().zip(stored.recipe.inputs));
                    }
                    // The base was a single file; nothing below it carries over
                    Op::WriteFile { .. } => {}
                    _ => return Ok(None),
                }
            }

            let mut groups: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
            for p in touched {
                let (head, rest) = match p.split_once('/') {
                    Some((head, rest)) => (head, rest),
                    None => (p, ""),
                };
                groups.entry(head).or_default().push(rest);
            }

            for (name, rest) in groups {
                let child_base = entries.get(name).cloned().unwrap_or(SnapshotId::Empty);
                let child = dir.entries().get(name);
                match self.rebuild(assembler, child_base, child, rest).await? {
                    None => return Ok(None),
                    Some(id) if id.is_empty() => {
                        entries.remove(name);
                    }
                    Some(id) => {
                        entries.insert(name.to_string(), id);
                    }
                }
            }
            assembler.dir(entries.into_iter().collect()).await.map(Some)
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cost::cost;
    use snap_core::{FileType, MemoryRecipeStore, PointerId, PointerKind, TreeDiff};

    const OWNER: OwnerId = OwnerId(5);

    struct Fixture {
        store: Arc<MemoryRecipeStore>,
        optimizer: Optimizer,
        materializer: Materializer,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryRecipeStore::new());
        let materializer = Materializer::new(store.clone());
        let optimizer = Optimizer::new(materializer.clone(), OptimizerConfig::default());
        Fixture {
            store,
            optimizer,
            materializer,
        }
    }

    fn edit_tag() -> RecipeTag {
        RecipeTag::Edit(PointerId::new(OWNER, "work", PointerKind::Workspace).unwrap())
    }

    async fn apply(store: &MemoryRecipeStore, base: &SnapshotId, ops: Vec<Op>) -> SnapshotId {
        let mut head = base.clone();
        for op in ops {
            head = store
                .create(Recipe::on(op, head), Some(OWNER), edit_tag())
                .await
                .unwrap()
                .0;
        }
        head
    }

    fn logs(n: usize) -> Vec<Op> {
        (0..n).map(|i| Op::write(format!("log{}.txt", i), format!("line {}", i))).collect()
    }

    #[tokio::test]
    async fn test_optimize_and_cost() {
        let f = fixture();
        let s = apply(&f.store, &SnapshotId::Empty, logs(25)).await;
        let cancel = CancellationToken::new();

        let c = f.optimizer.optimize(&s, &cancel).await.unwrap();
        assert!(c.is_content());
        assert_eq!(f.optimizer.optimized(&s).await.unwrap(), Some(c.clone()));

        let eval = f.materializer.evaluator();
        let all = cost(eval, &s, RecipeTag::Optimal, &PathMatcher::all(), &cancel)
            .await
            .unwrap();
        assert_eq!(all.ops, 27);
        assert_eq!(all.unoptimized, 1);

        let empty = cost(eval, &SnapshotId::Empty, RecipeTag::Optimal, &PathMatcher::all(), &cancel)
            .await
            .unwrap();
        assert_eq!(empty.ops, 0);

        let one = cost(
            eval,
            &s,
            RecipeTag::Optimal,
            &PathMatcher::new(["log1.txt"]).unwrap(),
            &cancel,
        )
        .await
        .unwrap();
        assert_eq!(one.ops, 3);
    }

    #[tokio::test]
    async fn test_optimize_is_idempotent_and_matches_tree() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let s = apply(
            &f.store,
            &SnapshotId::Empty,
            vec![
                Op::write("a/b/c.txt", "c"),
                Op::write("a/d.txt", "d"),
                Op::write("e", "e"),
                Op::ChmodFile {
                    path: "e".into(),
                    executable: true,
                },
            ],
        )
        .await;
        let c = f.optimizer.optimize(&s, &cancel).await.unwrap();
        assert_eq!(f.optimizer.optimize(&c, &cancel).await.unwrap(), c);
        assert_eq!(f.optimizer.optimize(&s, &cancel).await.unwrap(), c);

        let original = f.materializer.materialize_all(&s, &cancel).await.unwrap();
        let optimized = f.materializer.materialize_all(&c, &cancel).await.unwrap();
        assert!(TreeDiff::diff(&original, &optimized).is_empty());
        assert_eq!(optimized.content_id(), Some(&c));
    }

    #[tokio::test]
    async fn test_fast_and_slow_paths_agree() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let base = apply(
            &f.store,
            &SnapshotId::Empty,
            vec![
                Op::write("src/lib.rs", "lib"),
                Op::write("src/bin/main.rs", "main"),
                Op::write("docs/readme", "hi"),
                Op::write("top", "t"),
            ],
        )
        .await;
        f.optimizer.optimize(&base, &cancel).await.unwrap();

        let edits = vec![
            Op::write("src/bin/main.rs", "main2"),
            Op::remove("docs/readme"),
            Op::write("new/deep/file", "n"),
            Op::Rmdir { path: "top".into() },
            Op::write("top/inner", "now a dir"),
        ];
        let fast = apply(&f.store, &base, edits.clone()).await;
        let fast_id = f.optimizer.optimize(&fast, &cancel).await.unwrap();

        // A zero-length search always falls back to the slow path
        let slow_optimizer = Optimizer::new(
            f.materializer.clone(),
            OptimizerConfig {
                max_fast_path_search: 0,
                ..OptimizerConfig::default()
            },
        );
        let slow = apply(&f.store, &base, edits).await;
        let slow_id = slow_optimizer.optimize(&slow, &cancel).await.unwrap();
        assert_eq!(fast_id, slow_id);

        let tree = f.materializer.materialize_all(&fast_id, &cancel).await.unwrap();
        let paths: Vec<String> = tree.paths().into_iter().collect();
        assert_eq!(
            paths,
            vec!["new/deep/file", "src/bin/main.rs", "src/lib.rs", "top/inner"]
        );
    }

    #[tokio::test]
    async fn test_dir_order_does_not_change_content_id() {
        let store = Arc::new(MemoryRecipeStore::new());
        let assembler = DirAssembler::new(store.clone(), OWNER);
        let file = |data: &'static str| {
            Recipe::leaf(Op::WriteFile {
                path: String::new(),
                data: data.into(),
                executable: false,
                file_type: FileType::Regular,
            })
        };
        let (one, _) = store.create(file("1"), Some(OWNER), RecipeTag::Optimal).await.unwrap();
        let (two, _) = store.create(file("2"), Some(OWNER), RecipeTag::Optimal).await.unwrap();

        let forward = assembler
            .dir(vec![("n1".into(), one.clone()), ("n2".into(), two.clone())])
            .await
            .unwrap();
        let backward = assembler
            .dir(vec![("n2".into(), two), ("n1".into(), one)])
            .await
            .unwrap();
        assert_eq!(forward, backward);
        assert_eq!(assembler.dir(Vec::new()).await.unwrap(), SnapshotId::Empty);
    }

    #[tokio::test]
    async fn test_optimize_empty_tree_and_temp() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let s = apply(&f.store, &SnapshotId::Empty, vec![Op::write("a", "1"), Op::remove("a")]).await;
        assert_eq!(f.optimizer.optimize(&s, &cancel).await.unwrap(), SnapshotId::Empty);

        let (temp, _) = f
            .store
            .create(Recipe::leaf(Op::write("x", "1")), Some(OWNER), RecipeTag::Temp)
            .await
            .unwrap();
        let c = f.optimizer.optimize(&temp, &cancel).await.unwrap();
        assert!(c.is_content());
        assert_eq!(f.optimizer.optimized(&temp).await.unwrap(), None);
    }
}
