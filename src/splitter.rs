//! Sub-region splitting for `aggregate_by_geometry`.
//!
//! Region envelopes live in an R-tree, and so do the edges of every region.
//! An item is placed against a candidate region in increasing order of cost:
//!
//! 1. its bounding box touches no region edge: the box lies wholly inside
//!    (keep the item as is) or wholly outside (drop it), decided by a single
//!    point-in-polygon test;
//! 2. otherwise the actual geometry is related to the region: disjoint items
//!    are dropped, contained ones kept as is, and the rest get a lazily clipped
//!    geometry.

use crate::aggregator::Key;
use crate::geometry::{LazyGeometry, Overlap, clip, empty_geometry, overlap, rects_intersect};
use crate::osm::OsmEntity;
use crate::view::{Contribution, EntityState, Snapshot};
use geo::{BoundingRect, Contains, Coord, Geometry, MultiPolygon, Point, Rect};
use rstar::primitives::{GeomWithData, Rectangle};
use rstar::{AABB, RTree};
use std::sync::Arc;

type Envelope = GeomWithData<Rectangle<[f64; 2]>, usize>;
type Edge = GeomWithData<Rectangle<[f64; 2]>, (Coord<f64>, Coord<f64>)>;

fn envelope_of(rect: Rect<f64>) -> AABB<[f64; 2]> {
    AABB::from_corners([rect.min().x, rect.min().y], [rect.max().x, rect.max().y])
}

fn rectangle(a: Coord<f64>, b: Coord<f64>) -> Rectangle<[f64; 2]> {
    Rectangle::from_corners([a.x.min(b.x), a.y.min(b.y)], [a.x.max(b.x), a.y.max(b.y)])
}

/// Closed segment/rectangle intersection (Liang-Barsky).
fn segment_touches_rect(a: Coord<f64>, b: Coord<f64>, r: Rect<f64>) -> bool {
    let (dx, dy) = (b.x - a.x, b.y - a.y);
    let (mut t0, mut t1) = (0.0_f64, 1.0_f64);
    for (p, q) in [
        (-dx, a.x - r.min().x),
        (dx, r.max().x - a.x),
        (-dy, a.y - r.min().y),
        (dy, r.max().y - a.y),
    ] {
        if p == 0.0 {
            if q < 0.0 {
                return false;
            }
        } else {
            let t = q / p;
            if p < 0.0 {
                if t > t1 {
                    return false;
                }
                t0 = t0.max(t);
            } else {
                if t < t0 {
                    return false;
                }
                t1 = t1.min(t);
            }
        }
    }
    true
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BoxPosition {
    Inside,
    Outside,
    Boundary,
}

enum Placement {
    Drop,
    Whole,
    Clip,
}

struct Region<U> {
    key: U,
    area: Arc<MultiPolygon<f64>>,
    bbox: Rect<f64>,
    edges: RTree<Edge>,
}

impl<U> Region<U> {
    fn new(key: U, area: MultiPolygon<f64>, bbox: Rect<f64>) -> Self {
        let mut edges = Vec::new();
        for polygon in &area.0 {
            for ring in std::iter::once(polygon.exterior()).chain(polygon.interiors()) {
                for line in ring.lines() {
                    let bounds = rectangle(line.start, line.end);
                    edges.push(GeomWithData::new(bounds, (line.start, line.end)));
                }
            }
        }
        Self {
            key,
            area: Arc::new(area),
            bbox,
            edges: RTree::bulk_load(edges),
        }
    }

    fn position_of(&self, rect: Rect<f64>) -> BoxPosition {
        if !rects_intersect(self.bbox, rect) {
            return BoxPosition::Outside;
        }
        let crossed = self
            .edges
            .locate_in_envelope_intersecting(&envelope_of(rect))
            .any(|e| segment_touches_rect(e.data.0, e.data.1, rect));
        if crossed {
            BoxPosition::Boundary
        } else if self.area.contains(&Point::from(rect.center())) {
            BoxPosition::Inside
        } else {
            BoxPosition::Outside
        }
    }

    fn place(&self, geometry: &Geometry<f64>) -> Placement {
        let Some(rect) = geometry.bounding_rect() else {
            return Placement::Drop;
        };
        match self.position_of(rect) {
            BoxPosition::Inside => Placement::Whole,
            BoxPosition::Outside => Placement::Drop,
            BoxPosition::Boundary => match overlap(geometry, &self.area) {
                Some(Overlap::Disjoint) => Placement::Drop,
                Some(Overlap::Within) => Placement::Whole,
                Some(Overlap::Partial) | None => Placement::Clip,
            },
        }
    }

    /// The part of `geometry` inside this region, `None` when there is none.
    fn cut(&self, geometry: Arc<Geometry<f64>>) -> Option<LazyGeometry> {
        match self.place(&geometry) {
            Placement::Drop => None,
            Placement::Whole => Some(LazyGeometry::ready(geometry)),
            Placement::Clip => {
                let area = Arc::clone(&self.area);
                Some(LazyGeometry::deferred(move || clip(&geometry, &area)))
            }
        }
    }

    fn cut_side(&self, side: &Side) -> CutSide {
        side.as_ref()
            .map(|(entity, geometry)| (Arc::clone(entity), self.cut(Arc::clone(geometry))))
    }
}

/// A fixed set of keyed sub-regions.
pub struct GeometrySplitter<U> {
    regions: Vec<Region<U>>,
    index: RTree<Envelope>,
}

impl<U: Key> GeometrySplitter<U> {
    /// Regions with an empty area are ignored.
    pub fn new<G, I>(regions: I) -> Self
    where
        G: Into<MultiPolygon<f64>>,
        I: IntoIterator<Item = (U, G)>,
    {
        let regions: Vec<Region<U>> = regions
            .into_iter()
            .filter_map(|(key, area)| {
                let area: MultiPolygon<f64> = area.into();
                let bbox = area.bounding_rect()?;
                Some(Region::new(key, area, bbox))
            })
            .collect();
        let index = RTree::bulk_load(
            regions
                .iter()
                .enumerate()
                .map(|(i, r)| GeomWithData::new(rectangle(r.bbox.min(), r.bbox.max()), i))
                .collect(),
        );
        Self { regions, index }
    }

    #[must_use]
    pub fn keys(&self) -> Vec<U> {
        self.regions.iter().map(|r| r.key.clone()).collect()
    }

    fn candidates(&self, rect: Rect<f64>) -> Vec<&Region<U>> {
        let mut hits: Vec<usize> = self
            .index
            .locate_in_envelope_intersecting(&envelope_of(rect))
            .map(|e| e.data)
            .collect();
        hits.sort_unstable();
        hits.into_iter().map(|i| &self.regions[i]).collect()
    }

    pub(crate) fn split_snapshot(&self, snapshot: &Snapshot) -> Vec<(U, Snapshot)> {
        let geometry = snapshot.lazy_geometry().shared();
        let Some(rect) = geometry.bounding_rect() else {
            return Vec::new();
        };
        self.candidates(rect)
            .into_iter()
            .filter_map(|region| {
                let piece = region.cut(Arc::clone(&geometry))?;
                Some((region.key.clone(), snapshot.with_geometry(piece)))
            })
            .collect()
    }

    /// Each side is placed independently. A side that falls outside a region
    /// the other side reaches keeps its entity with an empty geometry.
    pub(crate) fn split_contribution(&self, contribution: &Contribution) -> Vec<(U, Contribution)> {
        let Some(rect) = contribution.bounding_rect() else {
            return Vec::new();
        };
        let before = side_of(contribution.before());
        let after = side_of(contribution.after());
        let mut out = Vec::new();
        for region in self.candidates(rect) {
            let (b, a) = (region.cut_side(&before), region.cut_side(&after));
            let reaches = |cut: &CutSide| cut.as_ref().is_some_and(|(_, piece)| piece.is_some());
            if !reaches(&b) && !reaches(&a) {
                continue;
            }
            out.push((
                region.key.clone(),
                contribution.with_states(state_of(b), state_of(a)),
            ));
        }
        out
    }
}

type Side = Option<(Arc<OsmEntity>, Arc<Geometry<f64>>)>;
type CutSide = Option<(Arc<OsmEntity>, Option<LazyGeometry>)>;

fn side_of(state: Option<&EntityState>) -> Side {
    state.map(|s| (Arc::clone(&s.entity), s.geometry.shared()))
}

fn state_of(cut: CutSide) -> Option<EntityState> {
    cut.map(|(entity, piece)| EntityState {
        entity,
        geometry: piece.unwrap_or_else(|| LazyGeometry::ready(Arc::new(empty_geometry()))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{Area, LineString, polygon};

    fn square(x0: f64, y0: f64, size: f64) -> MultiPolygon<f64> {
        MultiPolygon::new(vec![polygon![
            (x: x0, y: y0),
            (x: x0 + size, y: y0),
            (x: x0 + size, y: y0 + size),
            (x: x0, y: y0 + size),
        ]])
    }

    fn rect(x0: f64, y0: f64, x1: f64, y1: f64) -> Rect<f64> {
        Rect::new(Coord { x: x0, y: y0 }, Coord { x: x1, y: y1 })
    }

    #[test]
    fn segment_rect_touching() {
        let r = rect(0.0, 0.0, 1.0, 1.0);
        let c = |x, y| Coord { x, y };
        assert!(segment_touches_rect(c(-1.0, 0.5), c(2.0, 0.5), r));
        assert!(segment_touches_rect(c(1.0, -1.0), c(1.0, 2.0), r));
        assert!(!segment_touches_rect(c(2.0, 0.0), c(3.0, 1.0), r));
        assert!(!segment_touches_rect(c(-1.0, 1.5), c(1.5, 3.0), r));
    }

    #[test]
    fn box_positions() {
        let region = Region::new("r", square(0.0, 0.0, 10.0), rect(0.0, 0.0, 10.0, 10.0));
        assert_eq!(region.position_of(rect(2.0, 2.0, 3.0, 3.0)), BoxPosition::Inside);
        assert_eq!(region.position_of(rect(20.0, 2.0, 30.0, 3.0)), BoxPosition::Outside);
        assert_eq!(region.position_of(rect(8.0, 8.0, 12.0, 12.0)), BoxPosition::Boundary);
    }

    #[test]
    fn box_around_a_hole_is_outside() {
        let ring = |pts: &[(f64, f64)]| LineString::from(pts.to_vec());
        let donut = MultiPolygon::new(vec![geo::Polygon::new(
            ring(&[(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0), (0.0, 0.0)]),
            vec![ring(&[(3.0, 3.0), (7.0, 3.0), (7.0, 7.0), (3.0, 7.0), (3.0, 3.0)])],
        )]);
        let region = Region::new("d", donut, rect(0.0, 0.0, 10.0, 10.0));
        assert_eq!(region.position_of(rect(4.0, 4.0, 5.0, 5.0)), BoxPosition::Outside);
        assert_eq!(region.position_of(rect(1.0, 1.0, 2.0, 2.0)), BoxPosition::Inside);
    }

    #[test]
    fn tiles_partition_an_area() {
        let splitter = GeometrySplitter::new([
            (0, square(0.0, 0.0, 5.0)),
            (1, square(5.0, 0.0, 5.0)),
            (2, square(0.0, 5.0, 5.0)),
            (3, square(5.0, 5.0, 5.0)),
        ]);
        assert_eq!(splitter.keys(), vec![0, 1, 2, 3]);
        let item = Arc::new(Geometry::MultiPolygon(square(3.0, 3.0, 4.0)));
        let total: f64 = splitter
            .regions
            .iter()
            .filter_map(|r| r.cut(Arc::clone(&item)))
            .map(|g| g.get().unsigned_area())
            .sum();
        assert!((total - 16.0).abs() < 1e-9);
    }
}
