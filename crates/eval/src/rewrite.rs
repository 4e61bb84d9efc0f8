//! Rewriting creator: records equivalent recipes next to the ones written
//!
//! Wraps a recipe store. When a new snapshot is created, the rewriter tries
//! to find a different recipe producing the same tree and stores it as an
//! extra `Rewritten` path, so another machine holding the older inputs can
//! reuse them.
//!
//! - Linear: `b` over `a(x)` becomes `a2` over `b2(x)`, recursing while `b2`
//!   keeps commuting further down.
//! - Triangle: `overlay(a(x), r)`, with `r` built only from file writes that
//!   stay clear of `a`'s path, becomes `a` over `overlay(x, r)`.

use crate::transform::transform;
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use snap_core::{
    path, CreatorKind, Error, Op, OwnerId, Recipe, RecipeStore, RecipeTag, Result,
    RewriteDirection, SnapshotId, StoredRecipe,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

/// Recipe store decorator that records rewrites on create
pub struct RewritingStore {
    inner: Arc<dyn RecipeStore>,
    max_height: usize,
}

impl RewritingStore {
    pub fn new(inner: Arc<dyn RecipeStore>, max_height: usize) -> Self {
        Self { inner, max_height }
    }

    pub fn inner(&self) -> &Arc<dyn RecipeStore> {
        &self.inner
    }

    async fn rewrite(
        &self,
        recipe: &Recipe,
        owner: OwnerId,
        tag: &RecipeTag,
    ) -> Result<Option<(RewriteDirection, Recipe)>> {
        if let Some(linear) = self.linear(recipe, owner, tag, 0).await? {
            return Ok(Some((RewriteDirection::Linear, linear)));
        }
        if let Some(triangle) = self.triangle(recipe, owner, tag).await? {
            return Ok(Some((RewriteDirection::Triangle, triangle)));
        }
        Ok(None)
    }

    /// `recipe` with its op pushed below its input's op
    fn linear<'a>(
        &'a self,
        recipe: &'a Recipe,
        owner: OwnerId,
        tag: &'a RecipeTag,
        height: usize,
    ) -> BoxFuture<'a, Result<Option<Recipe>>> {
        async move {
            if height >= self.max_height {
                return Ok(None);
            }
            let input = match recipe.inputs.as_slice() {
                [input] if !input.is_empty() && !input.is_content() => input,
                _ => return Ok(None),
            };
            let below = self.inner.lookup(input, tag).await?;
            let base = match below.recipe.single_input() {
                Some(base) if !base.is_temp() => base.clone(),
                _ => return Ok(None),
            };
            let (above, pushed) = match transform(&below.recipe.op, &recipe.op) {
                Ok(pair) => pair,
                Err(Error::NoTransform(_)) => return Ok(None),
                Err(e) => return Err(e),
            };

            let lower = if pushed == Op::Identity {
                base
            } else {
                let lower = Recipe::on(pushed, base);
                let lower = match self.linear(&lower, owner, tag, height + 1).await? {
                    Some(deeper) => deeper,
                    None => lower,
                };
                self.inner
                    .create_by(
                        lower,
                        Some(owner),
                        RecipeTag::Rewritten(RewriteDirection::Linear),
                        CreatorKind::Rewrite,
                    )
                    .await?
                    .0
            };
            Ok(Some(Recipe::on(above, lower)))
        }
        .boxed()
    }

    /// `overlay(a(x), r)` as `a` over `overlay(x, r)`
    async fn triangle(&self, recipe: &Recipe, owner: OwnerId, tag: &RecipeTag) -> Result<Option<Recipe>> {
        let (left, right) = match (&recipe.op, recipe.inputs.as_slice()) {
            (Op::Overlay, [left, right]) if !left.is_empty() && !right.is_temp() => (left, right),
            _ => return Ok(None),
        };
        let written = match self.isolated_paths(right, tag).await? {
            Some(written) => written,
            None => return Ok(None),
        };

        let top = self.inner.lookup(left, tag).await?;
        let op = top.recipe.op.clone();
        let op_path = match op.path() {
            Some(p) if op.is_file_op() && !p.is_empty() => p,
            _ => return Ok(None),
        };
        if written
            .iter()
            .any(|w| path::is_within(w, op_path) || path::is_within(op_path, w))
        {
            return Ok(None);
        }
        let base = match top.recipe.single_input() {
            Some(base) if !base.is_temp() => base.clone(),
            _ => return Ok(None),
        };

        let (merged, _) = self
            .inner
            .create_by(
                Recipe::new(Op::Overlay, vec![base, right.clone()]),
                Some(owner),
                RecipeTag::Rewritten(RewriteDirection::Triangle),
                CreatorKind::Rewrite,
            )
            .await?;
        Ok(Some(Recipe::on(op, merged)))
    }

    /// Paths written by a chain of file ops over the empty snapshot
    async fn isolated_paths(&self, id: &SnapshotId, tag: &RecipeTag) -> Result<Option<BTreeSet<String>>> {
        let mut written = BTreeSet::new();
        let mut current = id.clone();
        for _ in 0..self.max_height {
            if current.is_empty() {
                return Ok(Some(written));
            }
            if current.is_content() {
                return Ok(None);
            }
            let stored = self.inner.lookup(&current, tag).await?;
            let input = match stored.recipe.single_input() {
                Some(input) => input.clone(),
                None => return Ok(None),
            };
            match stored.recipe.op.path() {
                Some(p) if stored.recipe.op.is_file_op() && !p.is_empty() => {
                    written.insert(p.to_string());
                }
                _ => return Ok(None),
            }
            current = input;
        }
        Ok(None)
    }
}

#[async_trait]
impl RecipeStore for RewritingStore {
    async fn create(
        &self,
        recipe: Recipe,
        owner: Option<OwnerId>,
        tag: RecipeTag,
    ) -> Result<(SnapshotId, bool)> {
        let (id, new) = self.inner.create(recipe.clone(), owner, tag.clone()).await?;
        let owner = match owner {
            Some(owner) if new && !id.is_temp() && !id.is_content() && tag != RecipeTag::Temp => owner,
            _ => return Ok((id, new)),
        };

        match self.rewrite(&recipe, owner, &tag).await {
            Ok(Some((direction, rewritten))) => {
                debug!(id = %id, ?direction, recipe = %rewritten, "recorded rewrite");
                self.inner
                    .create_path(StoredRecipe::new(
                        id.clone(),
                        RecipeTag::Rewritten(direction),
                        rewritten,
                    ))
                    .await?;
            }
            Ok(None) => {}
            Err(e) if e.is_not_found() => {
                debug!(id = %id, error = %e, "rewrite input missing");
            }
            Err(e) => return Err(e),
        }
        Ok((id, new))
    }

    async fn create_by(
        &self,
        recipe: Recipe,
        owner: Option<OwnerId>,
        tag: RecipeTag,
        creator: CreatorKind,
    ) -> Result<(SnapshotId, bool)> {
        self.inner.create_by(recipe, owner, tag, creator).await
    }

    async fn create_path(&self, stored: StoredRecipe) -> Result<()> {
        self.inner.create_path(stored).await
    }

    async fn lookup(&self, id: &SnapshotId, read_tag: &RecipeTag) -> Result<StoredRecipe> {
        self.inner.lookup(id, read_tag).await
    }

    async fn paths(&self, id: &SnapshotId) -> Result<Vec<StoredRecipe>> {
        self.inner.paths(id).await
    }
}
