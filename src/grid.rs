//! Fixed spatial grid used to partition entity histories into cells.
//!
//! Each zoom level `z` tiles the world with square cells `360 / 2^z` degrees
//! wide. An entity is stored in the deepest cell (up to the store's max zoom)
//! that fully contains its bounding box, so a query must look at candidate cells
//! on every level `0..=max_zoom`.

use crate::osm::OsmType;
use geo::{Rect, coord};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FormatResult};

/// Identifier of one grid cell on one zoom level.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CellId {
    pub zoom: u32,
    pub id: u64,
}

impl Display for CellId {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        write!(f, "{}:{}", self.zoom, self.id)
    }
}

/// Storage key of a cell: cells are kept separately per entity type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CellKey {
    pub osm_type: OsmType,
    pub cell: CellId,
}

/// Rectangular block of cells on a single zoom level (inclusive bounds).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CellIdRange {
    pub zoom: u32,
    pub x: (u64, u64),
    pub y: (u64, u64),
}

impl CellIdRange {
    #[must_use]
    pub fn contains(&self, cell: CellId) -> bool {
        if cell.zoom != self.zoom {
            return false;
        }
        let grid = XyGrid::new(self.zoom);
        let (x, y) = grid.xy(cell.id);
        (self.x.0..=self.x.1).contains(&x) && (self.y.0..=self.y.1).contains(&y)
    }

    /// Number of cells in the block (never zero).
    #[must_use]
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u64 {
        (self.x.1 - self.x.0 + 1) * (self.y.1 - self.y.0 + 1)
    }

    pub fn ids(&self) -> impl Iterator<Item = CellId> + '_ {
        let grid = XyGrid::new(self.zoom);
        (self.y.0..=self.y.1).flat_map(move |y| {
            (self.x.0..=self.x.1).map(move |x| CellId {
                zoom: grid.zoom,
                id: grid.id(x, y),
            })
        })
    }
}

/// Deepest supported level; cell ids of deeper levels do not fit a `u64`.
pub const MAX_ZOOM: u32 = 31;

/// One zoom level of the grid.
#[derive(Clone, Copy, Debug)]
pub struct XyGrid {
    zoom: u32,
    columns: u64,
    rows: u64,
    cell_width: f64,
}

impl XyGrid {
    /// Levels beyond [`MAX_ZOOM`] are clamped to it.
    #[must_use]
    pub fn new(zoom: u32) -> Self {
        let zoom = zoom.min(MAX_ZOOM);
        let columns = 1u64 << zoom;
        Self {
            zoom,
            columns,
            rows: (columns / 2).max(1),
            cell_width: 360.0 / columns as f64,
        }
    }

    fn id(&self, x: u64, y: u64) -> u64 {
        y * self.columns + x
    }

    fn xy(&self, id: u64) -> (u64, u64) {
        (id % self.columns, id / self.columns)
    }

    fn column(&self, lon: f64) -> u64 {
        let raw = ((lon + 180.0) / self.cell_width).floor();
        (raw.max(0.0) as u64).min(self.columns - 1)
    }

    fn row(&self, lat: f64) -> u64 {
        let raw = ((lat + 90.0) / self.cell_width).floor();
        (raw.max(0.0) as u64).min(self.rows - 1)
    }

    #[must_use]
    pub fn cell_at(&self, lon: f64, lat: f64) -> CellId {
        CellId {
            zoom: self.zoom,
            id: self.id(self.column(lon), self.row(lat)),
        }
    }

    /// All cells of this level overlapping `bbox`.
    #[must_use]
    pub fn range(&self, bbox: Rect<f64>) -> CellIdRange {
        CellIdRange {
            zoom: self.zoom,
            x: (self.column(bbox.min().x), self.column(bbox.max().x)),
            y: (self.row(bbox.min().y), self.row(bbox.max().y)),
        }
    }

    #[must_use]
    pub fn cell_bounds(&self, id: u64) -> Rect<f64> {
        let (x, y) = self.xy(id);
        let min_x = -180.0 + x as f64 * self.cell_width;
        let min_y = -90.0 + y as f64 * self.cell_width;
        Rect::new(
            coord! { x: min_x, y: min_y },
            coord! { x: min_x + self.cell_width, y: (min_y + self.cell_width).min(90.0) },
        )
    }
}

/// Candidate cell ranges for `bbox` on every level up to `max_zoom`.
#[must_use]
pub fn cell_ranges(bbox: Rect<f64>, max_zoom: u32) -> Vec<CellIdRange> {
    (0..=max_zoom).map(|z| XyGrid::new(z).range(bbox)).collect()
}

/// The deepest cell (at most `max_zoom`) that fully contains `bbox`.
#[must_use]
pub fn cell_for(bbox: Rect<f64>, max_zoom: u32) -> CellId {
    (0..=max_zoom)
        .rev()
        .map(XyGrid::new)
        .find_map(|grid| {
            let lo = grid.cell_at(bbox.min().x, bbox.min().y);
            let hi = grid.cell_at(bbox.max().x, bbox.max().y);
            (lo == hi).then_some(lo)
        })
        .unwrap_or(CellId { zoom: 0, id: 0 })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rect(x0: f64, y0: f64, x1: f64, y1: f64) -> Rect<f64> {
        Rect::new(coord! { x: x0, y: y0 }, coord! { x: x1, y: y1 })
    }

    #[test]
    fn zoom_zero_is_one_world_cell() {
        let g = XyGrid::new(0);
        assert_eq!(g.cell_at(-179.0, -89.0), g.cell_at(179.0, 89.0));
        assert_eq!(g.range(rect(-10.0, -10.0, 10.0, 10.0)).len(), 1);
    }

    #[test]
    fn deep_levels_are_clamped() {
        let g = XyGrid::new(64);
        let corner = g.cell_at(180.0, 90.0);
        assert_eq!(corner.zoom, MAX_ZOOM);
        assert_eq!(corner.id, (1u64 << (2 * MAX_ZOOM - 1)) - 1);
    }

    #[test]
    fn cell_for_picks_deepest_containing_level() {
        let small = rect(8.001, 49.001, 8.002, 49.002);
        let cell = cell_for(small, 10);
        assert_eq!(cell.zoom, 10);
        assert!(
            cell_ranges(small, 10)
                .iter()
                .any(|r| r.contains(cell))
        );

        // straddles the prime meridian, so only zoom 0 contains it
        let wide = rect(-1.0, 10.0, 1.0, 11.0);
        assert_eq!(cell_for(wide, 10).zoom, 0);
    }

    #[test]
    fn range_ids_match_contains() {
        let r = XyGrid::new(4).range(rect(0.0, 0.0, 50.0, 30.0));
        let ids: Vec<CellId> = r.ids().collect();
        assert_eq!(ids.len() as u64, r.len());
        assert!(ids.iter().all(|c| r.contains(*c)));
    }
}
