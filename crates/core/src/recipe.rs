//! Recipes, their wire format, and content-pure ID derivation

use crate::error::{Error, Result};
use crate::hash::IncrementalHasher;
use crate::id::{OwnerId, RecipeTag, SnapshotId};
use crate::op::{FileType, Op};
use serde::{Deserialize, Serialize};
use std::fmt;

/// An op applied to an ordered list of input snapshots
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipe {
    pub op: Op,
    pub inputs: Vec<SnapshotId>,
}

impl Recipe {
    pub fn new(op: Op, inputs: Vec<SnapshotId>) -> Self {
        Self { op, inputs }
    }

    /// Recipe with no inputs
    pub fn leaf(op: Op) -> Self {
        Self { op, inputs: Vec::new() }
    }

    /// Recipe with exactly one input; an empty input is dropped
    pub fn on(op: Op, input: SnapshotId) -> Self {
        if input.is_empty() {
            Self::leaf(op)
        } else {
            Self {
                op,
                inputs: vec![input],
            }
        }
    }

    /// Identity linking to `input`
    pub fn identity(input: SnapshotId) -> Self {
        Self {
            op: Op::Identity,
            inputs: vec![input],
        }
    }

    /// Check arity and op arguments
    pub fn validate(&self) -> Result<()> {
        self.op.validate()?;
        self.op.check_arity(self.inputs.len())
    }

    /// The single input of a linear recipe (empty when there is none)
    pub fn single_input(&self) -> Option<&SnapshotId> {
        match self.inputs.as_slice() {
            [] => Some(&SnapshotId::Empty),
            [one] => Some(one),
            _ => None,
        }
    }

    /// Derive the ID a content-pure recipe must have
    ///
    /// Returns `None` when the recipe is not content-pure and needs an ID
    /// minted by a creator.
    pub fn pure_id(&self, owner: OwnerId) -> Option<SnapshotId> {
        match &self.op {
            Op::WriteFile {
                path,
                data,
                executable,
                file_type,
            } if path.is_empty() && self.inputs.is_empty() => Some(SnapshotId::Content {
                owner,
                hash: file_content_hash(data, *executable, *file_type),
            }),
            Op::Dir { names } if names.is_empty() => Some(SnapshotId::Empty),
            Op::Dir { names } => {
                if names.windows(2).any(|w| w[0] >= w[1]) {
                    return None;
                }
                let mut hasher = IncrementalHasher::new();
                for (name, input) in names.iter().zip(&self.inputs) {
                    match input {
                        SnapshotId::Content { owner: o, hash } if *o == owner => {
                            hasher.update(hash.as_bytes());
                            hasher.update(name.as_bytes());
                            hasher.update(&[0]);
                        }
                        _ => return None,
                    }
                }
                Some(SnapshotId::Content {
                    owner,
                    hash: hasher.finalize(),
                })
            }
            _ => None,
        }
    }

    /// Encode to the binary wire format
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode from the binary wire format
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let recipe: Recipe = bincode::deserialize(bytes)?;
        recipe.validate()?;
        Ok(recipe)
    }
}

impl fmt::Display for Recipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.op)?;
        if !self.inputs.is_empty() {
            write!(f, " <- [")?;
            for (i, input) in self.inputs.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", input)?;
            }
            write!(f, "]")?;
        }
        Ok(())
    }
}

/// Hash of a file's bytes plus its metadata suffix
///
/// A regular non-executable file hashes to the plain SHA-256 of its bytes.
pub fn file_content_hash(data: &[u8], executable: bool, file_type: FileType) -> crate::hash::ContentHash {
    let mut hasher = IncrementalHasher::new();
    hasher.update(data);
    if executable {
        hasher.update(&[1]);
    }
    if file_type != FileType::Regular {
        hasher.update(&[2 + file_type.index()]);
    }
    hasher.finalize()
}

/// One tagged path to a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRecipe {
    pub id: SnapshotId,
    pub tag: RecipeTag,
    pub recipe: Recipe,
}

impl StoredRecipe {
    pub fn new(id: SnapshotId, tag: RecipeTag, recipe: Recipe) -> Self {
        Self { id, tag, recipe }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let stored: StoredRecipe = bincode::deserialize(bytes)?;
        stored.recipe.validate()?;
        if stored.recipe.op.is_optimal_form() || stored.tag != RecipeTag::Optimal {
            Ok(stored)
        } else {
            Err(Error::Codec(format!(
                "{} cannot be stored under the optimal tag",
                stored.recipe.op.name()
            )))
        }
    }
}
