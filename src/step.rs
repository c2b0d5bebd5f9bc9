//! Type-erased pipeline steps.
//!
//! Every `map`/`flat_map`/`filter` call on a builder becomes one [`Step`]: a
//! boxed closure over [`Item`]s plus the [`TypeTag`]s of its input and output.
//! The typed builder guarantees the tags line up; the tags are kept so a broken
//! chain is caught when it is assembled rather than while cells are scanned.

use crate::error::{Error, Result};
use crate::type_token::{Data, Item, TypeTag, boxed, peek, unbox};
use std::sync::Arc;

type MapFn = Arc<dyn Fn(Item) -> Result<Item> + Send + Sync>;
type RootMapFn<R> = Arc<dyn Fn(&R, Item) -> Result<Item> + Send + Sync>;
type FlatMapFn = Arc<dyn Fn(Item) -> Result<Vec<Item>> + Send + Sync>;
type FilterFn = Arc<dyn Fn(&Item) -> Result<bool> + Send + Sync>;

/// The closed set of step kinds.
pub(crate) enum StepFn<R> {
    /// Exactly one output per input.
    Map(MapFn),
    /// One output per input, computed with access to the root item the value
    /// was derived from.
    RootMap(RootMapFn<R>),
    /// Zero or more outputs per input.
    FlatMap(FlatMapFn),
    /// Zero or one output per input.
    Filter(FilterFn),
}

pub(crate) struct Step<R> {
    pub(crate) f: StepFn<R>,
    pub(crate) input: TypeTag,
    pub(crate) output: TypeTag,
}

impl<R: 'static> Step<R> {
    pub(crate) fn map<X, Y, F>(f: F) -> Self
    where
        X: Data,
        Y: Data,
        F: Fn(X) -> Result<Y> + Send + Sync + 'static,
    {
        Self {
            f: StepFn::Map(Arc::new(move |item| f(unbox::<X>(item)?).map(boxed))),
            input: TypeTag::of::<X>(),
            output: TypeTag::of::<Y>(),
        }
    }

    pub(crate) fn root_map<X, Y, F>(f: F) -> Self
    where
        X: Data,
        Y: Data,
        F: Fn(&R, X) -> Result<Y> + Send + Sync + 'static,
    {
        Self {
            f: StepFn::RootMap(Arc::new(move |root: &R, item: Item| {
                f(root, unbox::<X>(item)?).map(boxed)
            })),
            input: TypeTag::of::<X>(),
            output: TypeTag::of::<Y>(),
        }
    }

    pub(crate) fn flat_map<X, Y, F>(f: F) -> Self
    where
        X: Data,
        Y: Data,
        F: Fn(X) -> Result<Vec<Y>> + Send + Sync + 'static,
    {
        Self {
            f: StepFn::FlatMap(Arc::new(move |item| {
                Ok(f(unbox::<X>(item)?)?.into_iter().map(boxed).collect())
            })),
            input: TypeTag::of::<X>(),
            output: TypeTag::of::<Y>(),
        }
    }

    pub(crate) fn filter<X, F>(f: F) -> Self
    where
        X: Data,
        F: Fn(&X) -> bool + Send + Sync + 'static,
    {
        Self {
            f: StepFn::Filter(Arc::new(move |item: &Item| Ok(f(peek::<X>(item.as_ref())?)))),
            input: TypeTag::of::<X>(),
            output: TypeTag::of::<X>(),
        }
    }

    /// Whether this step always yields exactly one output.
    pub(crate) fn is_single(&self) -> bool {
        matches!(self.f, StepFn::Map(_) | StepFn::RootMap(_))
    }

    pub(crate) fn needs_root(&self) -> bool {
        matches!(self.f, StepFn::RootMap(_))
    }
}

fn missing_root() -> Error {
    Error::config("a root-dependent step was placed after the entity grouping boundary")
}

/// Run a chain of single-output steps on one value.
pub(crate) fn apply_single<R>(steps: &[Arc<Step<R>>], root: Option<&R>, seed: Item) -> Result<Item> {
    let mut item = seed;
    for step in steps {
        item = match &step.f {
            StepFn::Map(f) => f(item)?,
            StepFn::RootMap(f) => f(root.ok_or_else(missing_root)?, item)?,
            StepFn::FlatMap(_) | StepFn::Filter(_) => {
                return Err(Error::config(
                    "multi-output step on the single-output execution path",
                ));
            }
        };
    }
    Ok(item)
}

/// Run a chain of arbitrary steps on one value, keeping output order.
pub(crate) fn apply_steps<R>(
    steps: &[Arc<Step<R>>],
    root: Option<&R>,
    seed: Item,
) -> Result<Vec<Item>> {
    let mut items = vec![seed];
    for step in steps {
        if items.is_empty() {
            break;
        }
        items = match &step.f {
            StepFn::Map(f) => items.into_iter().map(|i| f(i)).collect::<Result<_>>()?,
            StepFn::RootMap(f) => {
                let root = root.ok_or_else(missing_root)?;
                items.into_iter().map(|i| f(root, i)).collect::<Result<_>>()?
            }
            StepFn::FlatMap(f) => {
                let mut out = Vec::with_capacity(items.len());
                for i in items {
                    out.extend(f(i)?);
                }
                out
            }
            StepFn::Filter(f) => {
                let mut out = Vec::with_capacity(items.len());
                for i in items {
                    if f(&i)? {
                        out.push(i);
                    }
                }
                out
            }
        };
    }
    Ok(items)
}
