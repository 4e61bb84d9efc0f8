//! Cost estimation: how many ops a materialization would have to visit

use crate::graph::{Descent, Evaluator, Step, Visitor};
use crate::materialize::{determines, input_matcher};
use snap_core::{PathMatcher, RecipeTag, Result, SnapshotId};
use std::ops::Add;
use tokio_util::sync::CancellationToken;

/// Ops reachable from a snapshot under a matcher
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct Cost {
    /// Every op visited
    pub ops: u64,
    /// Ops whose output is not content-addressed
    pub unoptimized: u64,
}

impl Add for Cost {
    type Output = Cost;

    fn add(self, rhs: Cost) -> Cost {
        Cost {
            ops: self.ops + rhs.ops,
            unoptimized: self.unoptimized + rhs.unoptimized,
        }
    }
}

#[derive(Clone)]
struct CostVisitor {
    matcher: PathMatcher,
    read_tag: RecipeTag,
}

impl Visitor for CostVisitor {
    type Value = Cost;

    fn empty(&self) -> Result<Cost> {
        Ok(Cost::default())
    }

    fn visit_backwards(&self, step: &Step, _input: &SnapshotId, index: usize) -> Result<Descent<Self>> {
        if determines(&self.matcher, &step.recipe.op) {
            return Ok(Descent::Empty);
        }
        Ok(match input_matcher(&self.matcher, &step.recipe.op, index) {
            Some(matcher) => Descent::Visit(Self {
                matcher,
                read_tag: self.read_tag.clone(),
            }),
            None => Descent::Empty,
        })
    }

    fn apply_op(&self, step: &Step, inputs: Vec<Cost>) -> Result<Cost> {
        let own = Cost {
            ops: 1,
            unoptimized: u64::from(!step.id.is_content()),
        };
        Ok(inputs.into_iter().fold(own, Add::add))
    }

    fn read_tag(&self) -> RecipeTag {
        self.read_tag.clone()
    }
}

/// Count the ops materializing `id` with `matcher` would visit
pub async fn cost(
    evaluator: &Evaluator,
    id: &SnapshotId,
    read_tag: RecipeTag,
    matcher: &PathMatcher,
    cancel: &CancellationToken,
) -> Result<Cost> {
    let visitor = CostVisitor {
        matcher: matcher.clone(),
        read_tag,
    };
    evaluator.evaluate(visitor, id, cancel).await
}
