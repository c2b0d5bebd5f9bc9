//! The step list behind every query builder.
//!
//! A [`Pipeline`] is an append-only list of [`Step`]s shared by reference count,
//! so every builder call copies a vector of pointers and never a closure. It
//! also records the grouping mode: with [`Grouping::ByEntityId`] the steps
//! registered before `group_by_entity()` run pointwise on every element of an
//! entity's history and the results are packed into one `Vec`; the steps after
//! it see that `Vec` as a single value.
//!
//! The pipeline turns itself into the two closure shapes backends execute:
//! a [`Mapper`] (exactly one output per root item) and a [`FlatMapper`] (any
//! number of outputs per entity history).

use crate::backend::{FlatMapper, Mapper};
use crate::error::{Error, Result};
use crate::step::{Step, apply_single, apply_steps};
use crate::type_token::{Data, Item, TypeTag, boxed, unbox};
use crate::view::View;
use std::sync::Arc;

type PackFn = Arc<dyn Fn(Vec<Item>) -> Result<Item> + Send + Sync>;

/// How root items are handed to the pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Grouping {
    /// Every item on its own.
    None,
    /// All items of one entity history at once, ascending by timestamp.
    ByEntityId,
}

pub(crate) struct Pipeline<R> {
    steps: Vec<Arc<Step<R>>>,
    grouping: Grouping,
    /// Number of steps registered before the grouping was set.
    boundary: usize,
    pack: Option<PackFn>,
    output: TypeTag,
}

impl<R> Clone for Pipeline<R> {
    fn clone(&self) -> Self {
        Self {
            steps: self.steps.clone(),
            grouping: self.grouping,
            boundary: self.boundary,
            pack: self.pack.clone(),
            output: self.output,
        }
    }
}

impl<R: View> Pipeline<R> {
    pub(crate) fn new() -> Self {
        Self {
            steps: Vec::new(),
            grouping: Grouping::None,
            boundary: 0,
            pack: None,
            output: TypeTag::of::<R>(),
        }
    }

    #[must_use]
    pub(crate) fn push(mut self, step: Step<R>) -> Self {
        debug_assert_eq!(
            step.input, self.output,
            "step consumes {} but the pipeline produces {}",
            step.input.name, self.output.name
        );
        self.output = step.output;
        self.steps.push(Arc::new(step));
        self
    }

    /// Switch to per-entity batches of `X`, the current output type.
    pub(crate) fn group_by_entity<X: Data>(mut self) -> Result<Self> {
        if self.grouping == Grouping::ByEntityId {
            return Err(Error::config("grouping is already set to by-entity-id"));
        }
        debug_assert_eq!(self.output, TypeTag::of::<X>());
        self.grouping = Grouping::ByEntityId;
        self.boundary = self.steps.len();
        self.pack = Some(Arc::new(|items: Vec<Item>| {
            let values = items
                .into_iter()
                .map(unbox::<X>)
                .collect::<Result<Vec<X>>>()?;
            Ok(boxed(values))
        }));
        self.output = TypeTag::of::<Vec<X>>();
        Ok(self)
    }

    pub(crate) fn grouping(&self) -> Grouping {
        self.grouping
    }

    pub(crate) fn len(&self) -> usize {
        self.steps.len()
    }

    /// True when no step can drop or multiply values, so every root item maps
    /// to exactly one output without intermediate lists.
    pub(crate) fn can_use_fast_path(&self) -> bool {
        self.grouping == Grouping::None && self.steps.iter().all(|s| s.is_single())
    }

    /// One output per root item. Only valid when [`Self::can_use_fast_path`].
    pub(crate) fn mapper(&self) -> Mapper<R> {
        let steps: Arc<[Arc<Step<R>>]> = self.steps.clone().into();
        let needs_root = steps.iter().any(|s| s.needs_root());
        Arc::new(move |root: R| {
            if needs_root {
                let seed = boxed(root.clone());
                apply_single(&steps, Some(&root), seed)
            } else {
                apply_single(&steps, None, boxed(root))
            }
        })
    }

    /// Pointwise application over every item of a history.
    pub(crate) fn item_flat_mapper(&self) -> FlatMapper<R> {
        let steps: Arc<[Arc<Step<R>>]> = self.steps.clone().into();
        Arc::new(move |group: Vec<R>| {
            let mut out = Vec::new();
            for root in group {
                out.extend(run_pointwise(&steps, root)?);
            }
            Ok(out)
        })
    }

    /// Pre-boundary steps pointwise, pack, post-boundary steps on the pack.
    ///
    /// A history whose items are all dropped before packing yields nothing.
    pub(crate) fn entity_flat_mapper(&self) -> Result<FlatMapper<R>> {
        let pack = self
            .pack
            .clone()
            .ok_or_else(|| Error::config("pipeline is not grouped by entity"))?;
        let pre: Arc<[Arc<Step<R>>]> = self.steps[..self.boundary].to_vec().into();
        let post: Arc<[Arc<Step<R>>]> = self.steps[self.boundary..].to_vec().into();
        if post.iter().any(|s| s.needs_root()) {
            return Err(Error::config(
                "steps after group_by_entity cannot depend on a single root item",
            ));
        }
        Ok(Arc::new(move |group: Vec<R>| {
            let mut values = Vec::with_capacity(group.len());
            for root in group {
                values.extend(run_pointwise(&pre, root)?);
            }
            if values.is_empty() {
                return Ok(Vec::new());
            }
            apply_steps(&post, None, pack(values)?)
        }))
    }
}

fn run_pointwise<R: Clone + Send + 'static>(steps: &[Arc<Step<R>>], root: R) -> Result<Vec<Item>> {
    if steps.iter().any(|s| s.needs_root()) {
        let seed = boxed(root.clone());
        apply_steps(steps, Some(&root), seed)
    } else {
        apply_steps(steps, None, boxed(root))
    }
}
