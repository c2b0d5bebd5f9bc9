//! The two item kinds a query can be run over.
//!
//! A [`Snapshot`] is one entity's state at one of the query instants; a
//! [`Contribution`] is one edit of one entity inside the query interval. Both
//! implement the sealed [`View`] trait, which carries everything the generic
//! query layer needs to know about them: how they are filtered, bucketed by
//! time, split by sub-region and dispatched to a backend.

use crate::aggregator::Key;
use crate::backend::{Acc, Backend, CellQuery, CellSource, FlatMapper, ItemStream, Mapper, ReduceFns};
use crate::error::Result;
use crate::filter::FilterExpression;
use crate::geometry::{LazyGeometry, union_rect};
use crate::mapreducer::MapReducer;
use crate::osm::{GridCell, OsmEntity, OsmType};
use crate::splitter::GeometrySplitter;
use crate::timestamps::{TimestampMs, Timestamps};
use geo::{BoundingRect, Geometry, Rect};
use std::fmt::{Debug, Formatter, Result as FormatResult};
use std::sync::Arc;

/// Lazy sequence of view items read from one cell.
pub type ViewIter<R> = Box<dyn Iterator<Item = Result<R>> + Send>;

/// Lazy sequence of per-entity item lists read from one cell.
pub type EntityGroupIter<R> = Box<dyn Iterator<Item = Result<Vec<R>>> + Send>;

mod sealed {
    pub trait Sealed {}
    impl Sealed for super::Snapshot {}
    impl Sealed for super::Contribution {}
}

/// A root item type a query can produce.
pub trait View: sealed::Sealed + Clone + Send + Sync + 'static {
    const NAME: &'static str;

    fn timestamp(&self) -> TimestampMs;

    /// Type and id of the entity this item belongs to.
    fn entity_key(&self) -> (OsmType, i64);

    /// Geometry-aware evaluation of a structured filter.
    fn matches(&self, filter: &FilterExpression) -> bool;

    #[doc(hidden)]
    fn timestamp_key(&self, timestamps: &Timestamps) -> Result<TimestampMs>;

    #[doc(hidden)]
    fn bucket(timestamps: &Timestamps, t: TimestampMs) -> Result<TimestampMs>;

    #[doc(hidden)]
    fn zerofill_timestamps(timestamps: &Timestamps) -> Vec<TimestampMs>;

    #[doc(hidden)]
    fn split_by<U: Key>(&self, splitter: &GeometrySplitter<U>) -> Vec<(U, Self)>;

    #[doc(hidden)]
    fn cell_items(source: &CellSource, cell: Arc<GridCell>) -> ViewIter<Self>;

    #[doc(hidden)]
    fn cell_entity_groups(source: &CellSource, cell: Arc<GridCell>) -> EntityGroupIter<Self>;

    #[doc(hidden)]
    fn map_reduce(
        backend: &dyn Backend,
        query: &CellQuery,
        mapper: Mapper<Self>,
        fns: ReduceFns,
    ) -> Result<Acc>;

    #[doc(hidden)]
    fn flat_map_reduce_grouped(
        backend: &dyn Backend,
        query: &CellQuery,
        mapper: FlatMapper<Self>,
        fns: ReduceFns,
    ) -> Result<Acc>;

    #[doc(hidden)]
    fn map_stream(backend: &dyn Backend, query: &CellQuery, mapper: Mapper<Self>) -> Result<ItemStream>;

    #[doc(hidden)]
    fn flat_map_stream_grouped(
        backend: &dyn Backend,
        query: &CellQuery,
        mapper: FlatMapper<Self>,
    ) -> Result<ItemStream>;
}

/// Entry point for snapshot queries.
pub struct SnapshotView;

impl SnapshotView {
    #[must_use]
    pub fn on(backend: Arc<dyn Backend>) -> MapReducer<Snapshot, Snapshot> {
        MapReducer::new(backend)
    }
}

/// Entry point for contribution queries.
pub struct ContributionView;

impl ContributionView {
    #[must_use]
    pub fn on(backend: Arc<dyn Backend>) -> MapReducer<Contribution, Contribution> {
        MapReducer::new(backend)
    }
}

/* ===================== Snapshot ===================== */

/// One entity's state at one query instant.
#[derive(Clone)]
pub struct Snapshot {
    timestamp: TimestampMs,
    entity: Arc<OsmEntity>,
    geometry: LazyGeometry,
}

impl Snapshot {
    #[must_use]
    pub fn new(timestamp: TimestampMs, entity: Arc<OsmEntity>, geometry: LazyGeometry) -> Self {
        Self {
            timestamp,
            entity,
            geometry,
        }
    }

    #[must_use]
    pub fn timestamp(&self) -> TimestampMs {
        self.timestamp
    }

    #[must_use]
    pub fn entity(&self) -> &Arc<OsmEntity> {
        &self.entity
    }

    /// The geometry, clipped to the area of interest (computed on first use).
    #[must_use]
    pub fn geometry(&self) -> &Geometry<f64> {
        self.geometry.get()
    }

    #[must_use]
    pub fn lazy_geometry(&self) -> &LazyGeometry {
        &self.geometry
    }

    #[must_use]
    pub fn with_geometry(&self, geometry: LazyGeometry) -> Self {
        Self {
            geometry,
            ..self.clone()
        }
    }
}

impl Debug for Snapshot {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        f.debug_struct("Snapshot")
            .field("timestamp", &self.timestamp)
            .field("type", &self.entity.osm_type)
            .field("id", &self.entity.id)
            .field("version", &self.entity.version)
            .finish_non_exhaustive()
    }
}

impl View for Snapshot {
    const NAME: &'static str = "snapshot";

    fn timestamp(&self) -> TimestampMs {
        self.timestamp
    }

    fn entity_key(&self) -> (OsmType, i64) {
        (self.entity.osm_type, self.entity.id)
    }

    fn matches(&self, filter: &FilterExpression) -> bool {
        filter.applies(&self.entity, self.geometry.get())
    }

    fn timestamp_key(&self, _timestamps: &Timestamps) -> Result<TimestampMs> {
        Ok(self.timestamp)
    }

    fn bucket(timestamps: &Timestamps, t: TimestampMs) -> Result<TimestampMs> {
        timestamps.floor_inclusive(t)
    }

    fn zerofill_timestamps(timestamps: &Timestamps) -> Vec<TimestampMs> {
        timestamps.as_slice().to_vec()
    }

    fn split_by<U: Key>(&self, splitter: &GeometrySplitter<U>) -> Vec<(U, Self)> {
        splitter.split_snapshot(self)
    }

    fn cell_items(source: &CellSource, cell: Arc<GridCell>) -> ViewIter<Self> {
        let filter = source.root_filter.clone();
        let maps = source
            .iterator
            .iterate_by_timestamps(cell, Arc::clone(&source.context));
        Box::new(maps.flat_map(move |entity| -> ViewIter<Snapshot> {
            match entity {
                Ok(states) => {
                    let filter = filter.clone();
                    Box::new(
                        states
                            .into_values()
                            .filter(move |s| filter.as_ref().is_none_or(|f| s.matches(f)))
                            .map(Ok),
                    )
                }
                Err(e) => Box::new(std::iter::once(Err(e.into()))),
            }
        }))
    }

    fn cell_entity_groups(source: &CellSource, cell: Arc<GridCell>) -> EntityGroupIter<Self> {
        let filter = source.root_filter.clone();
        let maps = source
            .iterator
            .iterate_by_timestamps(cell, Arc::clone(&source.context));
        Box::new(maps.filter_map(move |entity| match entity {
            Ok(states) => {
                let group: Vec<Snapshot> = states
                    .into_values()
                    .filter(|s| filter.as_ref().is_none_or(|f| s.matches(f)))
                    .collect();
                (!group.is_empty()).then_some(Ok(group))
            }
            Err(e) => Some(Err(e.into())),
        }))
    }

    fn map_reduce(
        backend: &dyn Backend,
        query: &CellQuery,
        mapper: Mapper<Self>,
        fns: ReduceFns,
    ) -> Result<Acc> {
        backend.map_reduce_snapshots(query, mapper, fns)
    }

    fn flat_map_reduce_grouped(
        backend: &dyn Backend,
        query: &CellQuery,
        mapper: FlatMapper<Self>,
        fns: ReduceFns,
    ) -> Result<Acc> {
        backend.flat_map_reduce_snapshots_grouped_by_id(query, mapper, fns)
    }

    fn map_stream(backend: &dyn Backend, query: &CellQuery, mapper: Mapper<Self>) -> Result<ItemStream> {
        backend.map_stream_snapshots(query, mapper)
    }

    fn flat_map_stream_grouped(
        backend: &dyn Backend,
        query: &CellQuery,
        mapper: FlatMapper<Self>,
    ) -> Result<ItemStream> {
        backend.flat_map_stream_snapshots_grouped_by_id(query, mapper)
    }
}

/* ===================== Contribution ===================== */

/// Kind of change an edit made.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ContributionType {
    Creation,
    Deletion,
    TagChange,
    GeometryChange,
}

impl ContributionType {
    pub const ALL: [ContributionType; 4] = [
        ContributionType::Creation,
        ContributionType::Deletion,
        ContributionType::TagChange,
        ContributionType::GeometryChange,
    ];

    const fn bit(self) -> u8 {
        1 << self as u8
    }
}

/// Set of [`ContributionType`]s.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ContributionTypes(u8);

impl ContributionTypes {
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn with(self, t: ContributionType) -> Self {
        Self(self.0 | t.bit())
    }

    #[must_use]
    pub const fn contains(self, t: ContributionType) -> bool {
        self.0 & t.bit() != 0
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = ContributionType> {
        ContributionType::ALL
            .into_iter()
            .filter(move |t| self.contains(*t))
    }
}

impl FromIterator<ContributionType> for ContributionTypes {
    fn from_iter<I: IntoIterator<Item = ContributionType>>(iter: I) -> Self {
        iter.into_iter().fold(Self::empty(), Self::with)
    }
}

impl Debug for ContributionTypes {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// An entity version with its geometry, one side of a [`Contribution`].
#[derive(Clone, Debug)]
pub struct EntityState {
    pub entity: Arc<OsmEntity>,
    pub geometry: LazyGeometry,
}

/// One edit of one entity.
///
/// `before` is absent for creations, `after` for deletions. The classification
/// is fixed when the edit is read and survives sub-region splitting unchanged.
#[derive(Clone)]
pub struct Contribution {
    version: Arc<OsmEntity>,
    next_timestamp: TimestampMs,
    before: Option<EntityState>,
    after: Option<EntityState>,
    activities: ContributionTypes,
}

impl Contribution {
    /// `version` is the entity version this edit wrote (an invisible one for deletions).
    #[must_use]
    pub fn new(
        version: Arc<OsmEntity>,
        next_timestamp: TimestampMs,
        before: Option<EntityState>,
        after: Option<EntityState>,
        activities: ContributionTypes,
    ) -> Self {
        Self {
            version,
            next_timestamp,
            before,
            after,
            activities,
        }
    }

    #[must_use]
    pub fn timestamp(&self) -> TimestampMs {
        self.version.timestamp
    }

    /// Time of the entity's next edit, or the end of the query interval.
    #[must_use]
    pub fn next_timestamp(&self) -> TimestampMs {
        self.next_timestamp
    }

    #[must_use]
    pub fn changeset_id(&self) -> i64 {
        self.version.changeset
    }

    #[must_use]
    pub fn version(&self) -> &Arc<OsmEntity> {
        &self.version
    }

    #[must_use]
    pub fn before(&self) -> Option<&EntityState> {
        self.before.as_ref()
    }

    #[must_use]
    pub fn after(&self) -> Option<&EntityState> {
        self.after.as_ref()
    }

    #[must_use]
    pub fn entity_before(&self) -> Option<&Arc<OsmEntity>> {
        self.before.as_ref().map(|s| &s.entity)
    }

    #[must_use]
    pub fn entity_after(&self) -> Option<&Arc<OsmEntity>> {
        self.after.as_ref().map(|s| &s.entity)
    }

    #[must_use]
    pub fn geometry_before(&self) -> Option<&Geometry<f64>> {
        self.before.as_ref().map(|s| s.geometry.get())
    }

    #[must_use]
    pub fn geometry_after(&self) -> Option<&Geometry<f64>> {
        self.after.as_ref().map(|s| s.geometry.get())
    }

    #[must_use]
    pub fn activities(&self) -> ContributionTypes {
        self.activities
    }

    #[must_use]
    pub fn is(&self, t: ContributionType) -> bool {
        self.activities.contains(t)
    }

    /// Union of the bounding boxes of both sides.
    #[must_use]
    pub fn bounding_rect(&self) -> Option<Rect<f64>> {
        [self.before.as_ref(), self.after.as_ref()]
            .into_iter()
            .flatten()
            .filter_map(|s| s.geometry.get().bounding_rect())
            .reduce(union_rect)
    }

    /// Copy with both sides replaced; identity and classification are kept.
    #[must_use]
    pub fn with_states(&self, before: Option<EntityState>, after: Option<EntityState>) -> Self {
        Self {
            before,
            after,
            ..self.clone()
        }
    }
}

impl Debug for Contribution {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        f.debug_struct("Contribution")
            .field("timestamp", &self.version.timestamp)
            .field("type", &self.version.osm_type)
            .field("id", &self.version.id)
            .field("activities", &self.activities)
            .finish_non_exhaustive()
    }
}

/// Splits a stream of items into runs that share an entity.
struct EntityRuns<R> {
    inner: ViewIter<R>,
    pending: Option<R>,
}

impl<R: View> Iterator for EntityRuns<R> {
    type Item = Result<Vec<R>>;

    fn next(&mut self) -> Option<Self::Item> {
        let first = match self.pending.take() {
            Some(item) => item,
            None => match self.inner.next()? {
                Ok(item) => item,
                Err(e) => return Some(Err(e)),
            },
        };
        let key = first.entity_key();
        let mut run = vec![first];
        loop {
            match self.inner.next() {
                Some(Ok(item)) if item.entity_key() == key => run.push(item),
                Some(Ok(item)) => {
                    self.pending = Some(item);
                    break;
                }
                Some(Err(e)) => return Some(Err(e)),
                None => break,
            }
        }
        Some(Ok(run))
    }
}

impl View for Contribution {
    const NAME: &'static str = "contribution";

    fn timestamp(&self) -> TimestampMs {
        self.version.timestamp
    }

    fn entity_key(&self) -> (OsmType, i64) {
        (self.version.osm_type, self.version.id)
    }

    fn matches(&self, filter: &FilterExpression) -> bool {
        [self.after.as_ref(), self.before.as_ref()]
            .into_iter()
            .flatten()
            .any(|s| filter.applies(&s.entity, s.geometry.get()))
    }

    fn timestamp_key(&self, timestamps: &Timestamps) -> Result<TimestampMs> {
        timestamps.floor(self.version.timestamp)
    }

    fn bucket(timestamps: &Timestamps, t: TimestampMs) -> Result<TimestampMs> {
        timestamps.floor(t)
    }

    fn zerofill_timestamps(timestamps: &Timestamps) -> Vec<TimestampMs> {
        timestamps.contribution_buckets()
    }

    fn split_by<U: Key>(&self, splitter: &GeometrySplitter<U>) -> Vec<(U, Self)> {
        splitter.split_contribution(self)
    }

    fn cell_items(source: &CellSource, cell: Arc<GridCell>) -> ViewIter<Self> {
        let filter = source.root_filter.clone();
        let edits = source.iterator.iterate_all(cell, Arc::clone(&source.context));
        Box::new(edits.filter_map(move |edit| match edit {
            Ok(c) => filter
                .as_ref()
                .is_none_or(|f| c.matches(f))
                .then_some(Ok(c)),
            Err(e) => Some(Err(e.into())),
        }))
    }

    fn cell_entity_groups(source: &CellSource, cell: Arc<GridCell>) -> EntityGroupIter<Self> {
        Box::new(EntityRuns {
            inner: Self::cell_items(source, cell),
            pending: None,
        })
    }

    fn map_reduce(
        backend: &dyn Backend,
        query: &CellQuery,
        mapper: Mapper<Self>,
        fns: ReduceFns,
    ) -> Result<Acc> {
        backend.map_reduce_contributions(query, mapper, fns)
    }

    fn flat_map_reduce_grouped(
        backend: &dyn Backend,
        query: &CellQuery,
        mapper: FlatMapper<Self>,
        fns: ReduceFns,
    ) -> Result<Acc> {
        backend.flat_map_reduce_contributions_grouped_by_id(query, mapper, fns)
    }

    fn map_stream(backend: &dyn Backend, query: &CellQuery, mapper: Mapper<Self>) -> Result<ItemStream> {
        backend.map_stream_contributions(query, mapper)
    }

    fn flat_map_stream_grouped(
        backend: &dyn Backend,
        query: &CellQuery,
        mapper: FlatMapper<Self>,
    ) -> Result<ItemStream> {
        backend.flat_map_stream_contributions_grouped_by_id(query, mapper)
    }
}
