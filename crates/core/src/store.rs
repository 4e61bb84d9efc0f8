//! Recipe store: snapshot ID assignment and tagged recipe paths
//!
//! Every snapshot ID maps to one or more `(tag, recipe)` paths. Content-pure
//! recipes get IDs derived from their content; everything else gets an ID
//! minted from this store's nonce and a monotonic counter.

use crate::error::{Error, Result};
use crate::id::{CreatorKind, OwnerId, RecipeTag, SnapshotId};
use crate::op::Op;
use crate::recipe::{Recipe, StoredRecipe};
use async_trait::async_trait;
use parking_lot::RwLock;
use rand::Rng;
use smallvec::SmallVec;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Read/write interface to the recipe graph
#[async_trait]
pub trait RecipeStore: Send + Sync {
    /// Assign an ID to `recipe` and record it under `tag`
    ///
    /// Returns the ID and whether a new path was recorded.
    async fn create(
        &self,
        recipe: Recipe,
        owner: Option<OwnerId>,
        tag: RecipeTag,
    ) -> Result<(SnapshotId, bool)>;

    /// Like [`create`](RecipeStore::create), minting any new ID under `creator`
    async fn create_by(
        &self,
        recipe: Recipe,
        owner: Option<OwnerId>,
        tag: RecipeTag,
        creator: CreatorKind,
    ) -> Result<(SnapshotId, bool)>;

    /// Record an additional tagged path to an existing snapshot
    async fn create_path(&self, stored: StoredRecipe) -> Result<()>;

    /// Find the recipe that best matches `read_tag`
    async fn lookup(&self, id: &SnapshotId, read_tag: &RecipeTag) -> Result<StoredRecipe>;

    /// Every path recorded for `id`, in insertion order
    async fn paths(&self, id: &SnapshotId) -> Result<Vec<StoredRecipe>>;

    /// Look up the path recorded under exactly `tag`
    async fn lookup_exact(&self, id: &SnapshotId, tag: &RecipeTag) -> Result<Option<StoredRecipe>> {
        match self.paths(id).await {
            Ok(paths) => Ok(paths.into_iter().find(|p| &p.tag == tag)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

type PathList = SmallVec<[(RecipeTag, Arc<Recipe>); 2]>;

/// In-memory recipe store guarded by one read/write lock
pub struct MemoryRecipeStore {
    nonce: String,
    creator: CreatorKind,
    counter: AtomicU64,
    recipes: RwLock<HashMap<SnapshotId, PathList>>,
}

impl MemoryRecipeStore {
    /// Create a store with a random creator nonce
    pub fn new() -> Self {
        let nonce = format!("{:08x}", rand::thread_rng().gen::<u32>());
        Self::with_nonce(nonce, CreatorKind::Local)
    }

    /// Create a store with a fixed nonce; IDs are then reproducible
    pub fn with_nonce(nonce: impl Into<String>, creator: CreatorKind) -> Self {
        let mut recipes = HashMap::new();
        let mut empty_paths = PathList::new();
        empty_paths.push((
            RecipeTag::Optimal,
            Arc::new(Recipe::leaf(Op::Dir { names: Vec::new() })),
        ));
        recipes.insert(SnapshotId::Empty, empty_paths);

        Self {
            nonce: nonce.into(),
            creator,
            counter: AtomicU64::new(0),
            recipes: RwLock::new(recipes),
        }
    }

    pub fn nonce(&self) -> &str {
        &self.nonce
    }

    /// Number of snapshot IDs known (including the empty snapshot)
    pub fn len(&self) -> usize {
        self.recipes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() <= 1
    }

    pub fn contains(&self, id: &SnapshotId) -> bool {
        self.recipes.read().contains_key(id)
    }

    fn mint(&self, owner: OwnerId, tag: &RecipeTag, creator: CreatorKind) -> SnapshotId {
        let index = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        if *tag == RecipeTag::Temp {
            SnapshotId::Temp {
                owner,
                name: format!("{}-{:x}", self.nonce, index),
            }
        } else {
            SnapshotId::Source {
                owner,
                creator,
                nonce: self.nonce.clone(),
                index,
            }
        }
    }

    fn check_inputs(map: &HashMap<SnapshotId, PathList>, recipe: &Recipe) -> Result<()> {
        for input in &recipe.inputs {
            if !map.contains_key(input) {
                return Err(Error::not_found(format!("recipe input {}", input)));
            }
        }
        Ok(())
    }
}

impl Default for MemoryRecipeStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecipeStore for MemoryRecipeStore {
    async fn create(
        &self,
        recipe: Recipe,
        owner: Option<OwnerId>,
        tag: RecipeTag,
    ) -> Result<(SnapshotId, bool)> {
        self.create_by(recipe, owner, tag, self.creator).await
    }

    async fn create_by(
        &self,
        recipe: Recipe,
        owner: Option<OwnerId>,
        tag: RecipeTag,
        creator: CreatorKind,
    ) -> Result<(SnapshotId, bool)> {
        recipe.validate()?;

        let owner = match (owner, &tag) {
            (Some(owner), _) => owner,
            (None, RecipeTag::Temp) => OwnerId::default(),
            (None, _) => {
                return Err(Error::InvalidArgument(format!(
                    "owner required to create {} under {}",
                    recipe.op.name(),
                    tag
                )))
            }
        };

        let pure = recipe.pure_id(owner);
        if pure == Some(SnapshotId::Empty) {
            return Ok((SnapshotId::Empty, false));
        }

        if tag == RecipeTag::Optimal {
            if !recipe.op.is_optimal_form() {
                return Err(Error::InvalidArgument(format!(
                    "{} cannot be written under the optimal tag",
                    recipe.op.name()
                )));
            }
            if pure.is_none() && recipe.op != Op::Identity {
                return Err(Error::InvalidArgument(format!(
                    "optimal recipe {} is not content-pure",
                    recipe
                )));
            }
        }

        let mut map = self.recipes.write();
        Self::check_inputs(&map, &recipe)?;

        let id = match pure {
            Some(id) => {
                if let Some(paths) = map.get_mut(&id) {
                    let populated = paths.iter().any(|(t, _)| *t != RecipeTag::Temp);
                    if populated || tag == RecipeTag::Temp || paths.iter().any(|(t, _)| *t == tag) {
                        return Ok((id, false));
                    }
                    paths.push((tag, Arc::new(recipe)));
                    return Ok((id, true));
                }
                id
            }
            None => self.mint(owner, &tag, creator),
        };

        debug!(id = %id, tag = %tag, op = recipe.op.name(), "created snapshot");
        let mut paths = PathList::new();
        paths.push((tag, Arc::new(recipe)));
        map.insert(id.clone(), paths);
        Ok((id, true))
    }

    async fn create_path(&self, stored: StoredRecipe) -> Result<()> {
        if stored.id.is_temp() {
            return Err(Error::TempWrite(stored.id.to_string()));
        }
        if let Some(temp) = stored.recipe.inputs.iter().find(|i| i.is_temp()) {
            return Err(Error::TempWrite(temp.to_string()));
        }
        stored.recipe.validate()?;
        if stored.tag == RecipeTag::Optimal && !stored.recipe.op.is_optimal_form() {
            return Err(Error::InvalidArgument(format!(
                "{} cannot be written under the optimal tag",
                stored.recipe.op.name()
            )));
        }

        let mut map = self.recipes.write();
        Self::check_inputs(&map, &stored.recipe)?;

        let paths = match map.get_mut(&stored.id) {
            Some(paths) => paths,
            None if stored.id.is_content() => map.entry(stored.id.clone()).or_default(),
            None => return Err(Error::not_found(format!("snapshot {}", stored.id))),
        };

        if let Some((_, existing)) = paths.iter().find(|(t, _)| *t == stored.tag) {
            if **existing == stored.recipe {
                return Ok(());
            }
            return Err(Error::Conflict {
                id: stored.id.to_string(),
                tag: stored.tag.to_string(),
            });
        }

        debug!(id = %stored.id, tag = %stored.tag, "recorded path");
        paths.push((stored.tag, Arc::new(stored.recipe)));
        Ok(())
    }

    async fn lookup(&self, id: &SnapshotId, read_tag: &RecipeTag) -> Result<StoredRecipe> {
        let map = self.recipes.read();
        let paths = map
            .get(id)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| Error::not_found(format!("snapshot {}", id)))?;

        let (tag, recipe) = paths
            .iter()
            .find(|(t, _)| t == read_tag)
            .or_else(|| paths.iter().find(|(t, _)| t.same_kind(read_tag)))
            .unwrap_or(&paths[0]);

        Ok(StoredRecipe {
            id: id.clone(),
            tag: tag.clone(),
            recipe: Recipe::clone(recipe),
        })
    }

    async fn paths(&self, id: &SnapshotId) -> Result<Vec<StoredRecipe>> {
        let map = self.recipes.read();
        let paths = map
            .get(id)
            .ok_or_else(|| Error::not_found(format!("snapshot {}", id)))?;
        Ok(paths
            .iter()
            .map(|(tag, recipe)| StoredRecipe {
                id: id.clone(),
                tag: tag.clone(),
                recipe: Recipe::clone(recipe),
            })
            .collect())
    }
}
