//! Capabilities the engine consumes but does not implement.
//!
//! - [`CellStore`] hands out grid cells by key and enumerates the keys that
//!   fall into a block of the grid.
//! - [`CellIterator`] turns one cell's raw version histories into the lazy
//!   streams of [`Contribution`]s or per-entity [`Snapshot`] maps a view
//!   consumes.
//! - [`TagInterpreter`] decides how an entity's tags affect its geometry. The
//!   engine never calls it itself; it only threads it through to the iterator.
//!
//! [`crate::memory`] provides in-memory implementations of the first two.

use crate::grid::{CellIdRange, CellKey};
use crate::osm::{EntityHistory, GridCell, OsmEntity, OsmType, OsmTypeSet};
use crate::timestamps::{TimestampMs, Timestamps};
use crate::view::{Contribution, Snapshot};
use geo::{MultiPolygon, Rect};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Decides whether an entity describes an area.
pub trait TagInterpreter: Send + Sync {
    fn is_area(&self, entity: &OsmEntity) -> bool;
}

/// Area detection from a fixed list of area keys plus the `area=*` override.
#[derive(Clone, Debug)]
pub struct DefaultTagInterpreter {
    area_keys: Vec<String>,
}

impl Default for DefaultTagInterpreter {
    fn default() -> Self {
        let keys = [
            "building", "landuse", "leisure", "natural", "amenity", "place", "boundary",
            "area:highway",
        ];
        Self {
            area_keys: keys.iter().map(ToString::to_string).collect(),
        }
    }
}

impl DefaultTagInterpreter {
    #[must_use]
    pub fn with_area_keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            area_keys: keys.into_iter().map(Into::into).collect(),
        }
    }
}

impl TagInterpreter for DefaultTagInterpreter {
    fn is_area(&self, entity: &OsmEntity) -> bool {
        match entity.osm_type {
            OsmType::Node => false,
            OsmType::Relation => {
                entity.has_tag("type", "multipolygon") || entity.has_tag("type", "boundary")
            }
            OsmType::Way => match entity.tag("area") {
                Some("yes") => true,
                Some("no") => false,
                _ => self.area_keys.iter().any(|k| entity.has_tag_key(k)),
            },
        }
    }
}

/// Cheap test on a whole history, run before any version is decoded.
pub type HistoryPredicate = Arc<dyn Fn(&EntityHistory) -> bool + Send + Sync>;

/// Tag/type-level test on one entity version.
pub type EntityPredicate = Arc<dyn Fn(&OsmEntity) -> bool + Send + Sync>;

/// Everything a [`CellIterator`] needs to know about the running query.
#[derive(Clone)]
pub struct IterationContext {
    pub bbox: Rect<f64>,
    pub polygon: Option<Arc<MultiPolygon<f64>>>,
    pub timestamps: Timestamps,
    pub types: OsmTypeSet,
    pub tag_interpreter: Arc<dyn TagInterpreter>,
    pub pre_filter: HistoryPredicate,
    pub filter: EntityPredicate,
}

impl IterationContext {
    /// The interval contributions are reported for: `[first, last)`.
    #[must_use]
    pub fn time_interval(&self) -> (TimestampMs, TimestampMs) {
        self.timestamps.interval()
    }
}

pub type ContributionIter = Box<dyn Iterator<Item = anyhow::Result<Contribution>> + Send>;

/// One map per entity: query instant to the entity's state at that instant.
pub type SnapshotIter =
    Box<dyn Iterator<Item = anyhow::Result<BTreeMap<TimestampMs, Snapshot>>> + Send>;

/// Cell iteration capability.
///
/// Both methods must yield the items of one entity consecutively and in
/// ascending timestamp order.
pub trait CellIterator: Send + Sync {
    fn iterate_all(&self, cell: Arc<GridCell>, context: Arc<IterationContext>) -> ContributionIter;

    fn iterate_by_timestamps(
        &self,
        cell: Arc<GridCell>,
        context: Arc<IterationContext>,
    ) -> SnapshotIter;
}

/// Source of grid cells.
pub trait CellStore: Send + Sync {
    /// Fetch one cell; `Ok(None)` when nothing is stored under `key`.
    fn get_cell(&self, key: CellKey) -> anyhow::Result<Option<Arc<GridCell>>>;

    /// Keys of the cells worth fetching inside `range`.
    ///
    /// The default lists every cell of the block; stores that know which cells
    /// are populated should narrow this down.
    fn cell_keys(&self, osm_type: OsmType, range: &CellIdRange) -> anyhow::Result<Vec<CellKey>> {
        Ok(range.ids().map(|cell| CellKey { osm_type, cell }).collect())
    }
}
