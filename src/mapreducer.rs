//! The query builder.
//!
//! A [`MapReducer<R, X>`] describes a query over root items `R` (snapshots or
//! contributions) whose pipeline currently produces values of type `X`. Every
//! builder method returns a new value and leaves the receiver untouched; the
//! step list is shared between them by reference count. Nothing is read until a
//! terminal method (`reduce`, `count`, `collect`, `stream`, ...) runs.
//!
//! ```no_run
//! use histbeam::{SequentialBackend, SnapshotView, Timestamps};
//! use histbeam::memory::{MemoryCellIterator, MemoryCellStore};
//! use std::sync::Arc;
//!
//! # fn main() -> histbeam::Result<()> {
//! let store = Arc::new(MemoryCellStore::default());
//! let backend = Arc::new(SequentialBackend::new(store, Arc::new(MemoryCellIterator)));
//! let buildings = SnapshotView::on(backend)
//!     .timestamps(Timestamps::parse(&["2020-01-01", "2021-01-01"])?)
//!     .filter_str("building=* and type:way")?
//!     .aggregate_by_timestamp()?
//!     .count()?;
//! # let _ = buildings;
//! # Ok(())
//! # }
//! ```

use crate::aggregator::{Key, MapAggregator};
use crate::backend::{Acc, Backend, CellQuery, FlatMapper, Mapper, ReduceFns};
use crate::collaborator::{DefaultTagInterpreter, IterationContext, TagInterpreter};
use crate::combiners::{
    ApproxMedian, ApproxQuantiles, AverageF64, CombineFn, Count, DistinctCount, DistinctSet,
    Sum, WeightedAverage, WeightedValue,
};
use crate::error::{Error, Result};
use crate::filter::{FilterExpression, optimize};
use crate::grid;
use crate::osm::OsmTypeSet;
use crate::pipeline::{Grouping, Pipeline};
use crate::splitter::GeometrySplitter;
use crate::step::Step;
use crate::timestamps::{TimestampMs, Timestamps};
use crate::type_token::{Data, unbox};
use crate::view::View;
use geo::{BoundingRect, MultiPolygon, Polygon, Rect, coord};
use std::collections::HashSet;
use std::hash::Hash;
use std::marker::PhantomData;
use std::ops::Add;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Pull-based stream of typed query results.
pub type ResultStream<T> = Box<dyn Iterator<Item = Result<T>> + Send>;

/// Spatial restriction of a query.
#[derive(Clone, Debug)]
pub enum AreaOfInterest {
    BoundingBox(Rect<f64>),
    Polygon(Arc<MultiPolygon<f64>>),
}

fn world_rect() -> Rect<f64> {
    Rect::new(coord! { x: -180.0, y: -90.0 }, coord! { x: 180.0, y: 90.0 })
}

impl AreaOfInterest {
    #[must_use]
    pub fn world() -> Self {
        Self::BoundingBox(world_rect())
    }

    /// Bounding box of the area; an empty polygon falls back to the whole world
    /// and is then rejected by the polygon test.
    #[must_use]
    pub fn bbox(&self) -> Rect<f64> {
        match self {
            Self::BoundingBox(r) => *r,
            Self::Polygon(p) => p.bounding_rect().unwrap_or_else(world_rect),
        }
    }

    #[must_use]
    pub fn polygon(&self) -> Option<Arc<MultiPolygon<f64>>> {
        match self {
            Self::BoundingBox(_) => None,
            Self::Polygon(p) => Some(Arc::clone(p)),
        }
    }
}

impl Default for AreaOfInterest {
    fn default() -> Self {
        Self::world()
    }
}

impl From<Rect<f64>> for AreaOfInterest {
    fn from(r: Rect<f64>) -> Self {
        Self::BoundingBox(r)
    }
}

impl From<Polygon<f64>> for AreaOfInterest {
    fn from(p: Polygon<f64>) -> Self {
        Self::Polygon(Arc::new(MultiPolygon::new(vec![p])))
    }
}

impl From<MultiPolygon<f64>> for AreaOfInterest {
    fn from(p: MultiPolygon<f64>) -> Self {
        Self::Polygon(Arc::new(p))
    }
}

/// Which of the two execution shapes a query runs with.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ExecPath {
    /// The single-output path whenever the pipeline allows it.
    #[default]
    Auto,
    /// Always the single-output path; a configuration error when not allowed.
    Fast,
    /// Always the per-entity flat path.
    Flat,
}

#[derive(Clone)]
pub(crate) struct QuerySettings {
    area: AreaOfInterest,
    timestamps: Option<Timestamps>,
    types: OsmTypeSet,
    filter: Option<Arc<FilterExpression>>,
    tag_interpreter: Arc<dyn TagInterpreter>,
    timeout: Option<Duration>,
    exec_path: ExecPath,
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            area: AreaOfInterest::default(),
            timestamps: None,
            types: OsmTypeSet::all(),
            filter: None,
            tag_interpreter: Arc::new(DefaultTagInterpreter::default()),
            timeout: None,
            exec_path: ExecPath::Auto,
        }
    }
}

enum Plan<R> {
    Fast(Mapper<R>),
    Flat(FlatMapper<R>),
}

/// A query over root items `R` whose pipeline currently yields `X`.
pub struct MapReducer<R: View, X> {
    pub(crate) backend: Arc<dyn Backend>,
    pub(crate) settings: QuerySettings,
    pub(crate) pipeline: Pipeline<R>,
    _out: PhantomData<fn() -> X>,
}

impl<R: View, X> Clone for MapReducer<R, X> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            settings: self.settings.clone(),
            pipeline: self.pipeline.clone(),
            _out: PhantomData,
        }
    }
}

impl<R: View> MapReducer<R, R> {
    pub(crate) fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            settings: QuerySettings::default(),
            pipeline: Pipeline::new(),
            _out: PhantomData,
        }
    }

    /// Split every root item by sub-region and aggregate by region key.
    ///
    /// Items crossing a region boundary are clipped to it; each region in
    /// `regions` is present in the result even when nothing falls into it.
    pub fn aggregate_by_geometry<U, G, I>(&self, regions: I) -> Result<MapAggregator<R, U, R>>
    where
        U: Key,
        G: Into<MultiPolygon<f64>>,
        I: IntoIterator<Item = (U, G)>,
    {
        self.require_ungrouped("aggregate_by_geometry")?;
        let splitter = Arc::new(GeometrySplitter::new(regions));
        let zerofill = splitter.keys();
        let split = self.with_step(Step::flat_map(move |r: R| Ok(r.split_by(&splitter))));
        Ok(MapAggregator::new(split, zerofill))
    }
}

impl<R: View, X: Data> MapReducer<R, X> {
    fn with_settings(&self, update: impl FnOnce(&mut QuerySettings)) -> Self {
        let mut next = self.clone();
        update(&mut next.settings);
        next
    }

    pub(crate) fn with_step<Y>(&self, step: Step<R>) -> MapReducer<R, Y> {
        MapReducer {
            backend: Arc::clone(&self.backend),
            settings: self.settings.clone(),
            pipeline: self.pipeline.clone().push(step),
            _out: PhantomData,
        }
    }

    pub(crate) fn require_ungrouped(&self, operation: &str) -> Result<()> {
        if self.pipeline.grouping() == Grouping::ByEntityId {
            return Err(Error::config(format!(
                "{operation} is not available after group_by_entity"
            )));
        }
        Ok(())
    }

    pub(crate) fn required_timestamps(&self) -> Result<Timestamps> {
        self.settings
            .timestamps
            .clone()
            .ok_or_else(|| Error::config("no timestamps configured"))
    }

    /* ---------- settings ---------- */

    #[must_use]
    pub fn area_of_interest(&self, area: impl Into<AreaOfInterest>) -> Self {
        let area = area.into();
        self.with_settings(|s| s.area = area)
    }

    #[must_use]
    pub fn timestamps(&self, timestamps: Timestamps) -> Self {
        self.with_settings(|s| s.timestamps = Some(timestamps))
    }

    /// Restrict to entity types; repeated calls narrow further.
    #[must_use]
    pub fn osm_types(&self, types: OsmTypeSet) -> Self {
        self.with_settings(|s| s.types = s.types.intersect(types))
    }

    /// Only entities that carry `key`.
    #[must_use]
    pub fn osm_tag(&self, key: &str) -> Self {
        self.filter_expr(FilterExpression::tag_key(key))
    }

    #[must_use]
    pub fn osm_tag_value(&self, key: &str, value: &str) -> Self {
        self.filter_expr(FilterExpression::tag(key, value))
    }

    /// Add a structured filter; repeated calls are combined with `and`.
    #[must_use]
    pub fn filter_expr(&self, expr: FilterExpression) -> Self {
        self.with_settings(|s| {
            let combined = match s.filter.take() {
                Some(existing) => (*existing).clone().and(expr),
                None => expr,
            };
            s.filter = Some(Arc::new(combined));
        })
    }

    /// Parse and add a textual filter such as `"highway=* and type:way"`.
    pub fn filter_str(&self, filter: &str) -> Result<Self> {
        Ok(self.filter_expr(FilterExpression::parse(filter)?))
    }

    #[must_use]
    pub fn tag_interpreter(&self, interpreter: Arc<dyn TagInterpreter>) -> Self {
        self.with_settings(|s| s.tag_interpreter = interpreter)
    }

    /// Deadline for the whole query; only cancelable backends honor it.
    #[must_use]
    pub fn timeout(&self, timeout: Duration) -> Self {
        self.with_settings(|s| s.timeout = Some(timeout))
    }

    #[must_use]
    pub fn execution_path(&self, path: ExecPath) -> Self {
        self.with_settings(|s| s.exec_path = path)
    }

    /* ---------- pipeline ---------- */

    /// Transform each value.
    #[must_use]
    pub fn map<Y, F>(&self, f: F) -> MapReducer<R, Y>
    where
        Y: Data,
        F: Fn(&X) -> Y + Send + Sync + 'static,
    {
        self.with_step(Step::map(move |x: X| Ok(f(&x))))
    }

    /// Transform each value into zero or more values.
    #[must_use]
    pub fn flat_map<Y, F>(&self, f: F) -> MapReducer<R, Y>
    where
        Y: Data,
        F: Fn(&X) -> Vec<Y> + Send + Sync + 'static,
    {
        self.with_step(Step::flat_map(move |x: X| Ok(f(&x))))
    }

    /// Keep values for which `f` returns true.
    #[must_use]
    pub fn filter<F>(&self, f: F) -> Self
    where
        F: Fn(&X) -> bool + Send + Sync + 'static,
    {
        self.with_step(Step::filter(f))
    }

    /// Process whole entity histories: the pipeline from here on sees one
    /// `Vec<X>` per entity, ascending by timestamp.
    pub fn group_by_entity(&self) -> Result<MapReducer<R, Vec<X>>> {
        Ok(MapReducer {
            backend: Arc::clone(&self.backend),
            settings: self.settings.clone(),
            pipeline: self.pipeline.clone().group_by_entity::<X>()?,
            _out: PhantomData,
        })
    }

    /// Whether the single-output execution path is available.
    #[must_use]
    pub fn can_use_fast_path(&self) -> bool {
        self.pipeline.can_use_fast_path()
    }

    /* ---------- aggregation ---------- */

    /// Aggregate by an arbitrary key.
    #[must_use]
    pub fn aggregate_by<U, F>(&self, f: F) -> MapAggregator<R, U, X>
    where
        U: Key,
        F: Fn(&X) -> U + Send + Sync + 'static,
    {
        self.aggregate_by_with_zerofill(f, Vec::new())
    }

    /// Aggregate by an arbitrary key; every key in `zerofill` is present in the
    /// result even when no value maps to it.
    #[must_use]
    pub fn aggregate_by_with_zerofill<U, F>(
        &self,
        f: F,
        zerofill: impl IntoIterator<Item = U>,
    ) -> MapAggregator<R, U, X>
    where
        U: Key,
        F: Fn(&X) -> U + Send + Sync + 'static,
    {
        let keyed = self.with_step(Step::map(move |x: X| Ok((f(&x), x))));
        MapAggregator::new(keyed, zerofill.into_iter().collect())
    }

    /// Aggregate by query instant.
    ///
    /// Snapshots are keyed by their own instant. Contributions are keyed by the
    /// largest instant at or before the edit; an edit outside the query span
    /// fails the query.
    pub fn aggregate_by_timestamp(&self) -> Result<MapAggregator<R, TimestampMs, X>> {
        self.require_ungrouped("aggregate_by_timestamp")?;
        let timestamps = self.required_timestamps()?;
        let zerofill = R::zerofill_timestamps(&timestamps);
        let keyed = self.with_step(Step::root_map(move |root: &R, x: X| {
            Ok((root.timestamp_key(&timestamps)?, x))
        }));
        Ok(MapAggregator::new(keyed, zerofill))
    }

    /// Aggregate by a time derived from each value, floor-matched into the
    /// query instants.
    pub fn aggregate_by_timestamp_with<F>(&self, f: F) -> Result<MapAggregator<R, TimestampMs, X>>
    where
        F: Fn(&X) -> TimestampMs + Send + Sync + 'static,
    {
        self.require_ungrouped("aggregate_by_timestamp")?;
        let timestamps = self.required_timestamps()?;
        let zerofill = R::zerofill_timestamps(&timestamps);
        let keyed =
            self.with_step(Step::map(move |x: X| Ok((R::bucket(&timestamps, f(&x))?, x))));
        Ok(MapAggregator::new(keyed, zerofill))
    }

    /* ---------- execution ---------- */

    fn prepare(&self) -> Result<CellQuery> {
        let timestamps = self.required_timestamps()?;
        let config = self.backend.config();
        let optimized = optimize(self.settings.filter.as_deref(), self.settings.types);
        let bbox = self.settings.area.bbox();

        let mut timeout = self.settings.timeout.or_else(|| config.timeout());
        if timeout.is_some() && !self.backend.is_cancelable() {
            warn!(
                backend = self.backend.name(),
                "backend cannot cancel queries, running without the timeout"
            );
            timeout = None;
        }

        let context = IterationContext {
            bbox,
            polygon: self.settings.area.polygon(),
            timestamps,
            types: optimized.types,
            tag_interpreter: Arc::clone(&self.settings.tag_interpreter),
            pre_filter: optimized.pre_filter,
            filter: optimized.filter,
        };
        Ok(CellQuery {
            context: Arc::new(context),
            ranges: grid::cell_ranges(bbox, config.max_zoom),
            root_filter: self.settings.filter.clone(),
            timeout,
        })
    }

    fn plan(&self) -> Result<Plan<R>> {
        let fast = self.pipeline.can_use_fast_path();
        match (self.pipeline.grouping(), self.settings.exec_path) {
            (Grouping::ByEntityId, ExecPath::Fast) => Err(Error::config(
                "the single-output path is not available for entity-grouped queries",
            )),
            (Grouping::ByEntityId, _) => Ok(Plan::Flat(self.pipeline.entity_flat_mapper()?)),
            (Grouping::None, ExecPath::Fast) if !fast => Err(Error::config(
                "the single-output path was forced but the pipeline can drop or multiply values",
            )),
            (Grouping::None, ExecPath::Fast | ExecPath::Auto) if fast => {
                Ok(Plan::Fast(self.pipeline.mapper()))
            }
            (Grouping::None, _) => Ok(Plan::Flat(self.pipeline.item_flat_mapper())),
        }
    }

    fn log_start(&self, plan: &Plan<R>, query: &CellQuery, terminal: &str) {
        let path = match plan {
            Plan::Fast(_) => "fast",
            Plan::Flat(_) => "flat",
        };
        info!(
            view = R::NAME,
            backend = self.backend.name(),
            path,
            grouping = ?self.pipeline.grouping(),
            steps = self.pipeline.len(),
            types = ?query.context.types,
            blocks = query.ranges.len(),
            terminal,
            "running query"
        );
    }

    pub(crate) fn reduce_erased(&self, fns: ReduceFns) -> Result<Acc> {
        let plan = self.plan()?;
        let query = self.prepare()?;
        self.log_start(&plan, &query, "reduce");
        let backend = self.backend.as_ref();
        match plan {
            Plan::Fast(mapper) => R::map_reduce(backend, &query, mapper, fns),
            Plan::Flat(mapper) => R::flat_map_reduce_grouped(backend, &query, mapper, fns),
        }
    }

    /* ---------- terminals ---------- */

    /// Fold every value with a reduce triple.
    ///
    /// `combiner` must be associative with `identity()` as its neutral element.
    pub fn reduce<S, I, A, C>(&self, identity: I, accumulator: A, combiner: C) -> Result<S>
    where
        S: Data,
        I: Fn() -> S + Send + Sync + 'static,
        A: Fn(S, X) -> S + Send + Sync + 'static,
        C: Fn(S, S) -> S + Send + Sync + 'static,
    {
        unbox(self.reduce_erased(ReduceFns::typed::<X, S, _, _, _>(
            identity,
            accumulator,
            combiner,
        ))?)
    }

    /// Fold every value with a [`CombineFn`].
    pub fn combine<C, A, O>(&self, combiner: C) -> Result<O>
    where
        C: CombineFn<X, A, O>,
        A: Data,
    {
        let c = Arc::new(combiner);
        let (create, add, merge) = (Arc::clone(&c), Arc::clone(&c), Arc::clone(&c));
        let acc: A = self.reduce(
            move || create.create(),
            move |mut acc, x| {
                add.add_input(&mut acc, x);
                acc
            },
            move |mut a, b| {
                merge.merge(&mut a, b);
                a
            },
        )?;
        Ok(c.finish(acc))
    }

    pub fn count(&self) -> Result<u64> {
        self.combine(Count)
    }

    pub fn collect(&self) -> Result<Vec<X>> {
        self.combine(crate::combiners::Collect::new())
    }

    pub fn uniq(&self) -> Result<HashSet<X>>
    where
        X: Eq + Hash,
    {
        self.combine(DistinctSet::new())
    }

    pub fn count_uniq(&self) -> Result<u64>
    where
        X: Eq + Hash,
    {
        self.combine(DistinctCount::new())
    }

    pub fn sum(&self) -> Result<X>
    where
        X: Add<Output = X> + Default,
    {
        self.combine(Sum::new())
    }

    /// Arithmetic mean; `NaN` when there are no values.
    pub fn average(&self) -> Result<f64>
    where
        X: Into<f64>,
    {
        self.combine(AverageF64)
    }

    pub fn estimated_median(&self) -> Result<f64>
    where
        X: Into<f64>,
    {
        self.combine(ApproxMedian::default())
    }

    pub fn estimated_quantile(&self, q: f64) -> Result<f64>
    where
        X: Into<f64>,
    {
        let mut estimates = self.estimated_quantiles(&[q])?;
        Ok(estimates.pop().unwrap_or(f64::NAN))
    }

    pub fn estimated_quantiles(&self, qs: &[f64]) -> Result<Vec<f64>>
    where
        X: Into<f64>,
    {
        self.combine(ApproxQuantiles::new(qs.to_vec()))
    }

    /// Pull results one by one.
    ///
    /// Backends without lazy streaming buffer the whole result first.
    pub fn stream(&self) -> Result<ResultStream<X>> {
        let plan = self.plan()?;
        let query = self.prepare()?;
        self.log_start(&plan, &query, "stream");
        let backend = self.backend.as_ref();
        let items = match plan {
            Plan::Fast(mapper) => R::map_stream(backend, &query, mapper)?,
            Plan::Flat(mapper) => R::flat_map_stream_grouped(backend, &query, mapper)?,
        };
        Ok(Box::new(items.map(|item| item.and_then(unbox::<X>))))
    }
}

impl<R: View> MapReducer<R, WeightedValue> {
    /// `sum(value * weight) / sum(weight)`.
    pub fn weighted_average(&self) -> Result<f64> {
        self.combine(WeightedAverage)
    }
}
