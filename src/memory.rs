//! In-memory implementations of the cell collaborators.
//!
//! [`MemoryCellStore`] keeps grid cells in a map and places each history in the
//! deepest cell containing all of its versions. [`MemoryCellIterator`] reads
//! histories whose geometries are already resolved, so it only has to pick
//! versions, classify edits and restrict geometries to the area of interest.
//! [`HistoryBuilder`] assembles histories for tests and small datasets.
//!
//! ```
//! use histbeam::memory::{HistoryBuilder, MemoryCellStore};
//!
//! let mut store = MemoryCellStore::default();
//! store.insert(
//!     HistoryBuilder::node(1)
//!         .point(100, &[("amenity", "cafe")], (8.68, 49.41))
//!         .point(200, &[("amenity", "bar")], (8.68, 49.41))
//!         .build(),
//! );
//! assert_eq!(store.len(), 1);
//! ```

use crate::collaborator::{
    CellIterator, CellStore, ContributionIter, IterationContext, SnapshotIter, TagInterpreter,
};
use crate::config::EngineConfig;
use crate::geometry::{LazyGeometry, Overlap, clip, empty_geometry, overlap, rect_contains, rects_intersect};
use crate::grid::{self, CellId, CellIdRange, CellKey};
use crate::osm::{EntityHistory, EntityVersion, GridCell, OsmEntity, OsmType};
use crate::timestamps::TimestampMs;
use crate::view::{Contribution, ContributionType, ContributionTypes, EntityState, Snapshot};
use geo::{BoundingRect, Geometry, LineString, MultiPolygon, Point, Polygon};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::trace;

/* ===================== store ===================== */

/// Grid cells held in memory.
pub struct MemoryCellStore {
    max_zoom: u32,
    cells: BTreeMap<CellKey, Arc<GridCell>>,
    fetches: AtomicUsize,
}

impl Default for MemoryCellStore {
    fn default() -> Self {
        Self::new(EngineConfig::default().max_zoom)
    }
}

impl MemoryCellStore {
    /// An empty store placing histories on levels `0..=max_zoom`.
    #[must_use]
    pub fn new(max_zoom: u32) -> Self {
        Self {
            max_zoom,
            cells: BTreeMap::new(),
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn from_histories(max_zoom: u32, histories: impl IntoIterator<Item = EntityHistory>) -> Self {
        let mut store = Self::new(max_zoom);
        for history in histories {
            store.insert(history);
        }
        store
    }

    /// Add a history to the cell that fully contains it.
    pub fn insert(&mut self, history: EntityHistory) -> CellKey {
        let cell = history
            .bounding_rect()
            .map_or(CellId { zoom: 0, id: 0 }, |r| grid::cell_for(r, self.max_zoom));
        let key = CellKey {
            osm_type: history.osm_type,
            cell,
        };
        let slot = self.cells.entry(key).or_insert_with(|| {
            Arc::new(GridCell {
                id: cell,
                osm_type: key.osm_type,
                histories: Vec::new(),
            })
        });
        Arc::make_mut(slot).histories.push(Arc::new(history));
        key
    }

    /// Number of populated cells.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = CellKey> + '_ {
        self.cells.keys().copied()
    }

    /// How many cells have been handed out so far.
    #[must_use]
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::Relaxed)
    }
}

impl CellStore for MemoryCellStore {
    fn get_cell(&self, key: CellKey) -> anyhow::Result<Option<Arc<GridCell>>> {
        let cell = self.cells.get(&key).cloned();
        if cell.is_some() {
            self.fetches.fetch_add(1, Ordering::Relaxed);
        }
        Ok(cell)
    }

    fn cell_keys(&self, osm_type: OsmType, range: &CellIdRange) -> anyhow::Result<Vec<CellKey>> {
        Ok(self
            .cells
            .keys()
            .filter(|k| k.osm_type == osm_type && range.contains(k.cell))
            .copied()
            .collect())
    }
}

/* ===================== histories ===================== */

/// Fluent builder for one entity's version history.
///
/// Version numbers and changeset ids count up from 1 in insertion order;
/// versions are sorted by timestamp on [`build`](Self::build).
pub struct HistoryBuilder {
    osm_type: OsmType,
    id: i64,
    versions: Vec<EntityVersion>,
}

fn tag_list(tags: &[(&str, &str)]) -> Vec<(String, String)> {
    tags.iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

impl HistoryBuilder {
    #[must_use]
    pub fn new(osm_type: OsmType, id: i64) -> Self {
        Self {
            osm_type,
            id,
            versions: Vec::new(),
        }
    }

    #[must_use]
    pub fn node(id: i64) -> Self {
        Self::new(OsmType::Node, id)
    }

    #[must_use]
    pub fn way(id: i64) -> Self {
        Self::new(OsmType::Way, id)
    }

    #[must_use]
    pub fn relation(id: i64) -> Self {
        Self::new(OsmType::Relation, id)
    }

    fn push(mut self, timestamp: TimestampMs, visible: bool, tags: &[(&str, &str)], geometry: Option<Geometry<f64>>) -> Self {
        let n = self.versions.len() + 1;
        let entity = OsmEntity {
            osm_type: self.osm_type,
            id: self.id,
            version: u32::try_from(n).unwrap_or(u32::MAX),
            timestamp,
            changeset: i64::try_from(n).unwrap_or(i64::MAX),
            visible,
            tags: tag_list(tags),
        };
        self.versions.push(EntityVersion {
            entity: Arc::new(entity),
            geometry: geometry.map(Arc::new),
        });
        self
    }

    /// A visible version with an arbitrary resolved geometry.
    #[must_use]
    pub fn version(self, timestamp: TimestampMs, tags: &[(&str, &str)], geometry: impl Into<Geometry<f64>>) -> Self {
        self.push(timestamp, true, tags, Some(geometry.into()))
    }

    /// A visible version located at one coordinate.
    #[must_use]
    pub fn point(self, timestamp: TimestampMs, tags: &[(&str, &str)], (x, y): (f64, f64)) -> Self {
        self.version(timestamp, tags, Point::new(x, y))
    }

    /// A visible version along a coordinate sequence; a closed sequence may
    /// become an area depending on the tag interpreter.
    #[must_use]
    pub fn line(self, timestamp: TimestampMs, tags: &[(&str, &str)], coords: &[(f64, f64)]) -> Self {
        self.version(timestamp, tags, LineString::from(coords.to_vec()))
    }

    /// A deletion.
    #[must_use]
    pub fn deleted(self, timestamp: TimestampMs) -> Self {
        self.push(timestamp, false, &[], None)
    }

    /// Override the changeset id of the latest version.
    #[must_use]
    pub fn changeset(mut self, changeset: i64) -> Self {
        if let Some(last) = self.versions.last_mut() {
            Arc::make_mut(&mut last.entity).changeset = changeset;
        }
        self
    }

    #[must_use]
    pub fn build(mut self) -> EntityHistory {
        self.versions.sort_by_key(|v| v.entity.timestamp);
        EntityHistory {
            osm_type: self.osm_type,
            id: self.id,
            versions: self.versions,
        }
    }
}

/* ===================== iteration ===================== */

/// Reference cell iterator over pre-resolved geometries.
#[derive(Clone, Copy, Debug, Default)]
pub struct MemoryCellIterator;

/// A closed way the tag interpreter deems an area becomes a polygon.
fn resolve(
    version: &EntityVersion,
    interpreter: &dyn TagInterpreter,
) -> Option<Arc<Geometry<f64>>> {
    let geometry = version.geometry.as_ref()?;
    if version.entity.osm_type == OsmType::Way
        && let Geometry::LineString(ring) = geometry.as_ref()
        && ring.is_closed()
        && ring.0.len() >= 4
        && interpreter.is_area(&version.entity)
    {
        return Some(Arc::new(Geometry::Polygon(Polygon::new(ring.clone(), Vec::new()))));
    }
    Some(Arc::clone(geometry))
}

/// Area-of-interest restriction shared by one iteration call.
struct Restriction {
    bbox: geo::Rect<f64>,
    region: Arc<MultiPolygon<f64>>,
    exact_bbox: bool,
}

impl Restriction {
    fn new(context: &IterationContext) -> Self {
        match &context.polygon {
            Some(polygon) => Self {
                bbox: context.bbox,
                region: Arc::clone(polygon),
                exact_bbox: false,
            },
            None => Self {
                bbox: context.bbox,
                region: Arc::new(MultiPolygon::new(vec![context.bbox.to_polygon()])),
                exact_bbox: true,
            },
        }
    }

    /// The part of `geometry` inside the area, `None` when there is none.
    fn apply(&self, geometry: Arc<Geometry<f64>>) -> Option<LazyGeometry> {
        let rect = geometry.bounding_rect()?;
        if !rects_intersect(self.bbox, rect) {
            return None;
        }
        if self.exact_bbox && rect_contains(self.bbox, rect) {
            return Some(LazyGeometry::ready(geometry));
        }
        match overlap(&geometry, &self.region) {
            Some(Overlap::Disjoint) => None,
            Some(Overlap::Within) => Some(LazyGeometry::ready(geometry)),
            Some(Overlap::Partial) | None => {
                let region = Arc::clone(&self.region);
                Some(LazyGeometry::deferred(move || clip(&geometry, &region)))
            }
        }
    }
}

fn selected(history: &EntityHistory, context: &IterationContext) -> bool {
    context.types.contains(history.osm_type) && (context.pre_filter)(history)
}

fn snapshots_of(
    history: &EntityHistory,
    context: &IterationContext,
    restriction: &Restriction,
) -> BTreeMap<TimestampMs, Snapshot> {
    let mut states = BTreeMap::new();
    for t in context.timestamps.iter() {
        let Some(version) = history.version_at(t) else {
            continue;
        };
        if !version.entity.visible || !(context.filter)(version.entity.as_ref()) {
            continue;
        }
        let Some(geometry) = resolve(version, context.tag_interpreter.as_ref()) else {
            continue;
        };
        if let Some(geometry) = restriction.apply(geometry) {
            states.insert(t, Snapshot::new(t, Arc::clone(&version.entity), geometry));
        }
    }
    states
}

fn contributions_of(
    history: &EntityHistory,
    context: &IterationContext,
    restriction: &Restriction,
) -> Vec<Contribution> {
    let (first, last) = context.time_interval();
    let interpreter = context.tag_interpreter.as_ref();
    let mut out = Vec::new();
    for (i, version) in history.versions.iter().enumerate() {
        let t = version.entity.timestamp;
        if t < first || t >= last {
            continue;
        }
        let previous = i
            .checked_sub(1)
            .map(|j| &history.versions[j])
            .filter(|p| p.entity.visible);
        let current = Some(version).filter(|v| v.entity.visible);

        let side = |v: &EntityVersion| {
            let geometry = resolve(v, interpreter).unwrap_or_else(|| Arc::new(empty_geometry()));
            (Arc::clone(&v.entity), geometry)
        };
        let before = previous.map(side);
        let after = current.map(side);

        let activities: ContributionTypes = match (&before, &after) {
            (None, None) => continue,
            (None, Some(_)) => ContributionTypes::empty().with(ContributionType::Creation),
            (Some(_), None) => ContributionTypes::empty().with(ContributionType::Deletion),
            (Some((eb, gb)), Some((ea, ga))) => {
                let mut kinds = ContributionTypes::empty();
                if eb.tags != ea.tags {
                    kinds = kinds.with(ContributionType::TagChange);
                }
                if gb != ga {
                    kinds = kinds.with(ContributionType::GeometryChange);
                }
                kinds
            }
        };
        if activities.is_empty() {
            continue;
        }

        let passes = |side: &Option<(Arc<OsmEntity>, Arc<Geometry<f64>>)>| {
            side.as_ref().is_some_and(|(e, _)| (context.filter)(e.as_ref()))
        };
        if !passes(&before) && !passes(&after) {
            continue;
        }

        let restrict = |side: Option<(Arc<OsmEntity>, Arc<Geometry<f64>>)>| {
            side.map(|(entity, geometry)| (entity, restriction.apply(geometry)))
        };
        let (before, after) = (restrict(before), restrict(after));
        let inside = |side: &Option<(Arc<OsmEntity>, Option<LazyGeometry>)>| {
            side.as_ref().is_some_and(|(_, g)| g.is_some())
        };
        if !inside(&before) && !inside(&after) {
            continue;
        }
        let state = |side: Option<(Arc<OsmEntity>, Option<LazyGeometry>)>| {
            side.map(|(entity, geometry)| EntityState {
                entity,
                geometry: geometry
                    .unwrap_or_else(|| LazyGeometry::ready(Arc::new(empty_geometry()))),
            })
        };

        let next_timestamp = history
            .versions
            .get(i + 1)
            .map_or(last, |n| n.entity.timestamp.min(last));
        out.push(Contribution::new(
            Arc::clone(&version.entity),
            next_timestamp,
            state(before),
            state(after),
            activities,
        ));
    }
    out
}

impl CellIterator for MemoryCellIterator {
    fn iterate_all(&self, cell: Arc<GridCell>, context: Arc<IterationContext>) -> ContributionIter {
        trace!(cell = %cell.id, histories = cell.histories.len(), "iterating contributions");
        let restriction = Restriction::new(&context);
        let histories = cell.histories.clone();
        Box::new(
            histories
                .into_iter()
                .flat_map(move |h| {
                    if selected(&h, &context) {
                        contributions_of(&h, &context, &restriction)
                    } else {
                        Vec::new()
                    }
                })
                .map(Ok),
        )
    }

    fn iterate_by_timestamps(
        &self,
        cell: Arc<GridCell>,
        context: Arc<IterationContext>,
    ) -> SnapshotIter {
        trace!(cell = %cell.id, histories = cell.histories.len(), "iterating snapshots");
        let restriction = Restriction::new(&context);
        let histories = cell.histories.clone();
        Box::new(histories.into_iter().filter_map(move |h| {
            if !selected(&h, &context) {
                return None;
            }
            let states = snapshots_of(&h, &context, &restriction);
            (!states.is_empty()).then_some(Ok(states))
        }))
    }
}
