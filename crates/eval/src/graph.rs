//! Generic backwards walker over the recipe graph
//!
//! A [`Visitor`] decides, input by input, whether to recurse, substitute a
//! value, or substitute the empty value, and then combines the input values
//! into the value of the node. Linear chains are walked iteratively in the
//! calling task; multi-input ops evaluate their inputs concurrently and the
//! first error wins.

use futures::future::{self, BoxFuture, FutureExt};
use snap_core::{Error, Recipe, RecipeStore, RecipeTag, Result, SnapshotId, StoredRecipe};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// The recipe being evaluated, with the ID it produces
#[derive(Debug, Clone)]
pub struct Step {
    pub id: SnapshotId,
    pub tag: RecipeTag,
    pub recipe: Recipe,
}

impl From<StoredRecipe> for Step {
    fn from(stored: StoredRecipe) -> Self {
        Self {
            id: stored.id,
            tag: stored.tag,
            recipe: stored.recipe,
        }
    }
}

/// How to obtain the value of one input
pub enum Descent<V: Visitor> {
    /// Use this value without visiting the input
    Value(V::Value),
    /// Visit the input with this visitor
    Visit(V),
    /// Use `empty()` without visiting the input
    Empty,
}

/// Hooks driving one evaluation
pub trait Visitor: Sized + Send + Sync + 'static {
    type Value: Send + 'static;

    /// Value of the empty snapshot
    fn empty(&self) -> Result<Self::Value>;

    /// Value known for `id` without reading its recipe
    fn visit_node(&self, _id: &SnapshotId) -> Result<Option<Self::Value>> {
        Ok(None)
    }

    /// Decide how to evaluate input `index` of `step`
    fn visit_backwards(
        &self,
        step: &Step,
        input: &SnapshotId,
        index: usize,
    ) -> Result<Descent<Self>>;

    /// Combine input values into the value of `step`
    fn apply_op(&self, step: &Step, inputs: Vec<Self::Value>) -> Result<Self::Value>;

    /// Tag used to choose among a snapshot's paths
    fn read_tag(&self) -> RecipeTag {
        RecipeTag::Optimal
    }
}

/// Runs visitors against a recipe store
#[derive(Clone)]
pub struct Evaluator {
    store: Arc<dyn RecipeStore>,
}

impl Evaluator {
    pub fn new(store: Arc<dyn RecipeStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn RecipeStore> {
        &self.store
    }

    /// Evaluate `id` with `visitor`
    pub async fn evaluate<V: Visitor>(
        &self,
        visitor: V,
        id: &SnapshotId,
        cancel: &CancellationToken,
    ) -> Result<V::Value> {
        walk(self.store.clone(), cancel.clone(), visitor, id.clone()).await
    }
}

fn walk<V: Visitor>(
    store: Arc<dyn RecipeStore>,
    cancel: CancellationToken,
    visitor: V,
    id: SnapshotId,
) -> BoxFuture<'static, Result<V::Value>> {
    async move {
        // Pending single-input steps, innermost last
        let mut frames: Vec<(V, Step)> = Vec::new();
        let mut visitor = visitor;
        let mut id = id;

        let mut value = loop {
            if cancel.is_cancelled() {
                return Err(Error::Canceled);
            }
            if id.is_empty() {
                break visitor.empty()?;
            }
            if let Some(known) = visitor.visit_node(&id)? {
                break known;
            }

            let step: Step = store.lookup(&id, &visitor.read_tag()).await?.into();
            match step.recipe.inputs.len() {
                0 => break visitor.apply_op(&step, Vec::new())?,
                1 => {
                    let input = step.recipe.inputs[0].clone();
                    match visitor.visit_backwards(&step, &input, 0)? {
                        Descent::Value(v) => break visitor.apply_op(&step, vec![v])?,
                        Descent::Empty => {
                            let empty = visitor.empty()?;
                            break visitor.apply_op(&step, vec![empty])?;
                        }
                        Descent::Visit(child) => {
                            frames.push((visitor, step));
                            visitor = child;
                            id = input;
                        }
                    }
                }
                _ => {
                    let mut pending = Vec::with_capacity(step.recipe.inputs.len());
                    for (index, input) in step.recipe.inputs.iter().enumerate() {
                        let fut = match visitor.visit_backwards(&step, input, index)? {
                            Descent::Value(v) => future::ready(Ok(v)).boxed(),
                            Descent::Empty => future::ready(visitor.empty()).boxed(),
                            Descent::Visit(child) => {
                                walk(store.clone(), cancel.clone(), child, input.clone())
                            }
                        };
                        pending.push(fut);
                    }
                    let values = future::try_join_all(pending).await?;
                    break visitor.apply_op(&step, values)?;
                }
            }
        };

        while let Some((visitor, step)) = frames.pop() {
            value = visitor.apply_op(&step, vec![value])?;
        }
        Ok(value)
    }
    .boxed()
}
