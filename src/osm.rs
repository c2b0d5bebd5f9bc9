//! OpenStreetMap entities and their stored version histories.
//!
//! A [`GridCell`] holds the complete [`EntityHistory`] of every entity assigned
//! to it. Histories are ordered ascending by version timestamp and carry the
//! geometry the storage layer resolved for each version.

use crate::grid::CellId;
use crate::timestamps::TimestampMs;
use geo::{BoundingRect, Geometry, Rect};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FormatResult};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsmType {
    Node,
    Way,
    Relation,
}

impl OsmType {
    pub const ALL: [OsmType; 3] = [OsmType::Node, OsmType::Way, OsmType::Relation];

    const fn bit(self) -> u8 {
        match self {
            OsmType::Node => 0b001,
            OsmType::Way => 0b010,
            OsmType::Relation => 0b100,
        }
    }
}

impl Display for OsmType {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        let s = match self {
            OsmType::Node => "node",
            OsmType::Way => "way",
            OsmType::Relation => "relation",
        };
        f.write_str(s)
    }
}

/// A set of OSM entity types.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OsmTypeSet(u8);

impl OsmTypeSet {
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn all() -> Self {
        Self(0b111)
    }

    #[must_use]
    pub const fn of(t: OsmType) -> Self {
        Self(t.bit())
    }

    #[must_use]
    pub const fn contains(self, t: OsmType) -> bool {
        self.0 & t.bit() != 0
    }

    #[must_use]
    pub const fn with(self, t: OsmType) -> Self {
        Self(self.0 | t.bit())
    }

    #[must_use]
    pub const fn intersect(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub const fn complement(self) -> Self {
        Self(!self.0 & 0b111)
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = OsmType> {
        OsmType::ALL.into_iter().filter(move |t| self.contains(*t))
    }
}

impl FromIterator<OsmType> for OsmTypeSet {
    fn from_iter<I: IntoIterator<Item = OsmType>>(iter: I) -> Self {
        iter.into_iter().fold(Self::empty(), Self::with)
    }
}

impl std::fmt::Debug for OsmTypeSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// One version of an OSM entity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsmEntity {
    pub osm_type: OsmType,
    pub id: i64,
    pub version: u32,
    pub timestamp: TimestampMs,
    pub changeset: i64,
    pub visible: bool,
    pub tags: Vec<(String, String)>,
}

impl OsmEntity {
    #[must_use]
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    #[must_use]
    pub fn has_tag_key(&self, key: &str) -> bool {
        self.tag(key).is_some()
    }

    #[must_use]
    pub fn has_tag(&self, key: &str, value: &str) -> bool {
        self.tag(key) == Some(value)
    }
}

/// A stored version together with its resolved geometry (absent when deleted).
#[derive(Clone, Debug)]
pub struct EntityVersion {
    pub entity: Arc<OsmEntity>,
    pub geometry: Option<Arc<Geometry<f64>>>,
}

/// The full version history of one entity, ascending by timestamp.
#[derive(Clone, Debug)]
pub struct EntityHistory {
    pub osm_type: OsmType,
    pub id: i64,
    pub versions: Vec<EntityVersion>,
}

impl EntityHistory {
    /// Whether any version satisfies `pred`.
    pub fn any_version(&self, pred: impl Fn(&OsmEntity) -> bool) -> bool {
        self.versions.iter().any(|v| pred(&v.entity))
    }

    /// Latest version at or before `t`.
    #[must_use]
    pub fn version_at(&self, t: TimestampMs) -> Option<&EntityVersion> {
        let idx = self.versions.partition_point(|v| v.entity.timestamp <= t);
        idx.checked_sub(1).map(|i| &self.versions[i])
    }

    /// Union of every version's bounding box.
    #[must_use]
    pub fn bounding_rect(&self) -> Option<Rect<f64>> {
        self.versions
            .iter()
            .filter_map(|v| v.geometry.as_ref().and_then(|g| g.bounding_rect()))
            .reduce(crate::geometry::union_rect)
    }
}

/// All entity histories stored in one grid cell for one entity type.
#[derive(Clone, Debug)]
pub struct GridCell {
    pub id: CellId,
    pub osm_type: OsmType,
    pub histories: Vec<Arc<EntityHistory>>,
}
