//! Geometry helpers: memoized lazy geometries, rectangle predicates and
//! fault-tolerant clipping against polygonal regions.

use geo::{
    BooleanOps, Geometry, GeometryCollection, Intersects, LineString, MultiLineString,
    MultiPoint, MultiPolygon, Rect, Relate, coord,
};
use std::fmt::{Debug, Formatter, Result as FormatResult};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};
use tracing::debug;

type GeometryInit = Box<dyn Fn() -> Geometry<f64> + Send + Sync>;

struct LazyInner {
    value: OnceLock<Arc<Geometry<f64>>>,
    init: Option<GeometryInit>,
}

/// A geometry that is computed on first access and then shared.
///
/// Clones share the same cell, so the computation runs at most once no matter
/// how many copies of an item carry it.
#[derive(Clone)]
pub struct LazyGeometry(Arc<LazyInner>);

impl LazyGeometry {
    #[must_use]
    pub fn ready(geometry: Arc<Geometry<f64>>) -> Self {
        let value = OnceLock::new();
        let _ = value.set(geometry);
        Self(Arc::new(LazyInner { value, init: None }))
    }

    pub fn deferred(init: impl Fn() -> Geometry<f64> + Send + Sync + 'static) -> Self {
        Self(Arc::new(LazyInner {
            value: OnceLock::new(),
            init: Some(Box::new(init)),
        }))
    }

    #[must_use]
    pub fn get(&self) -> &Geometry<f64> {
        self.shared_ref().as_ref()
    }

    #[must_use]
    pub fn shared(&self) -> Arc<Geometry<f64>> {
        Arc::clone(self.shared_ref())
    }

    #[must_use]
    pub fn is_evaluated(&self) -> bool {
        self.0.value.get().is_some()
    }

    fn shared_ref(&self) -> &Arc<Geometry<f64>> {
        self.0.value.get_or_init(|| {
            Arc::new(match &self.0.init {
                Some(init) => init(),
                None => empty_geometry(),
            })
        })
    }
}

impl Debug for LazyGeometry {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        match self.0.value.get() {
            Some(g) => f.debug_tuple("LazyGeometry").field(g).finish(),
            None => f.write_str("LazyGeometry(<deferred>)"),
        }
    }
}

/// Coarse geometry class used by `geometry:` filters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GeometryKind {
    Point,
    Line,
    Polygon,
    Other,
}

#[must_use]
pub fn kind_of(geometry: &Geometry<f64>) -> GeometryKind {
    match geometry {
        Geometry::Point(_) | Geometry::MultiPoint(_) => GeometryKind::Point,
        Geometry::Line(_) | Geometry::LineString(_) | Geometry::MultiLineString(_) => {
            GeometryKind::Line
        }
        Geometry::Polygon(_)
        | Geometry::MultiPolygon(_)
        | Geometry::Rect(_)
        | Geometry::Triangle(_) => GeometryKind::Polygon,
        Geometry::GeometryCollection(_) => GeometryKind::Other,
    }
}

#[must_use]
pub fn empty_geometry() -> Geometry<f64> {
    Geometry::GeometryCollection(GeometryCollection(Vec::new()))
}

#[must_use]
pub fn union_rect(a: Rect<f64>, b: Rect<f64>) -> Rect<f64> {
    Rect::new(
        coord! { x: a.min().x.min(b.min().x), y: a.min().y.min(b.min().y) },
        coord! { x: a.max().x.max(b.max().x), y: a.max().y.max(b.max().y) },
    )
}

/// Closed-rectangle overlap test (touching edges count).
#[must_use]
pub fn rects_intersect(a: Rect<f64>, b: Rect<f64>) -> bool {
    a.min().x <= b.max().x && b.min().x <= a.max().x && a.min().y <= b.max().y && b.min().y <= a.max().y
}

#[must_use]
pub fn rect_contains(outer: Rect<f64>, inner: Rect<f64>) -> bool {
    outer.min().x <= inner.min().x
        && outer.min().y <= inner.min().y
        && outer.max().x >= inner.max().x
        && outer.max().y >= inner.max().y
}

/// How a geometry relates to a region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Overlap {
    Disjoint,
    Within,
    Partial,
}

/// Relate `geometry` to `region`; `None` when the topology computation failed.
pub(crate) fn overlap(geometry: &Geometry<f64>, region: &MultiPolygon<f64>) -> Option<Overlap> {
    panic::catch_unwind(AssertUnwindSafe(|| {
        let matrix = geometry.relate(&Geometry::MultiPolygon(region.clone()));
        if matrix.is_disjoint() {
            Overlap::Disjoint
        } else if matrix.is_within() {
            Overlap::Within
        } else if matrix.is_touches() {
            // Only boundaries meet: points on the boundary belong to the region,
            // lines and areas contribute nothing.
            match geometry {
                Geometry::Point(_) => Overlap::Within,
                Geometry::MultiPoint(_) => Overlap::Partial,
                _ => Overlap::Disjoint,
            }
        } else {
            Overlap::Partial
        }
    }))
    .ok()
}

/// Intersect `geometry` with `region`.
///
/// Malformed input that makes the overlay fail yields an empty geometry.
#[must_use]
pub fn clip(geometry: &Geometry<f64>, region: &MultiPolygon<f64>) -> Geometry<f64> {
    panic::catch_unwind(AssertUnwindSafe(|| clip_unchecked(geometry, region))).unwrap_or_else(
        |_| {
            debug!("topology failure while clipping, substituting an empty geometry");
            empty_geometry()
        },
    )
}

fn clip_unchecked(geometry: &Geometry<f64>, region: &MultiPolygon<f64>) -> Geometry<f64> {
    match geometry {
        Geometry::Point(p) => {
            if region.intersects(p) {
                geometry.clone()
            } else {
                empty_geometry()
            }
        }
        Geometry::MultiPoint(mp) => Geometry::MultiPoint(MultiPoint::new(
            mp.iter().filter(|p| region.intersects(*p)).copied().collect(),
        )),
        Geometry::Line(l) => clip_lines(
            &MultiLineString::new(vec![LineString::new(vec![l.start, l.end])]),
            region,
        ),
        Geometry::LineString(ls) => clip_lines(&MultiLineString::new(vec![ls.clone()]), region),
        Geometry::MultiLineString(mls) => clip_lines(mls, region),
        Geometry::Polygon(p) => clip_areas(&MultiPolygon::new(vec![p.clone()]), region),
        Geometry::MultiPolygon(mp) => clip_areas(mp, region),
        Geometry::Rect(r) => clip_areas(&MultiPolygon::new(vec![r.to_polygon()]), region),
        Geometry::Triangle(t) => clip_areas(&MultiPolygon::new(vec![t.to_polygon()]), region),
        Geometry::GeometryCollection(gc) => Geometry::GeometryCollection(GeometryCollection(
            gc.iter().map(|g| clip_unchecked(g, region)).collect(),
        )),
    }
}

fn clip_lines(lines: &MultiLineString<f64>, region: &MultiPolygon<f64>) -> Geometry<f64> {
    Geometry::MultiLineString(region.clip(lines, false))
}

fn clip_areas(areas: &MultiPolygon<f64>, region: &MultiPolygon<f64>) -> Geometry<f64> {
    Geometry::MultiPolygon(areas.intersection(region))
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{Area, Point, polygon};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn square(x0: f64, y0: f64, size: f64) -> MultiPolygon<f64> {
        MultiPolygon::new(vec![polygon![
            (x: x0, y: y0),
            (x: x0 + size, y: y0),
            (x: x0 + size, y: y0 + size),
            (x: x0, y: y0 + size),
        ]])
    }

    #[test]
    fn lazy_geometry_computes_once_across_clones() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let lazy = LazyGeometry::deferred(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Geometry::Point(Point::new(1.0, 2.0))
        });
        let copy = lazy.clone();
        assert!(!lazy.is_evaluated());
        assert_eq!(kind_of(copy.get()), GeometryKind::Point);
        assert_eq!(kind_of(lazy.get()), GeometryKind::Point);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn clip_polygon_keeps_overlap_area() {
        let item = Geometry::MultiPolygon(square(0.0, 0.0, 2.0));
        let clipped = clip(&item, &square(1.0, 1.0, 2.0));
        assert!((clipped.unsigned_area() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn clip_point_outside_is_empty() {
        let item = Geometry::Point(Point::new(5.0, 5.0));
        let clipped = clip(&item, &square(0.0, 0.0, 1.0));
        assert_eq!(clipped, empty_geometry());
    }

    #[test]
    fn overlap_classifies_positions() {
        let region = square(0.0, 0.0, 10.0);
        let inside = Geometry::Point(Point::new(5.0, 5.0));
        let outside = Geometry::Point(Point::new(50.0, 5.0));
        let straddling = Geometry::MultiPolygon(square(8.0, 8.0, 4.0));
        assert_eq!(overlap(&inside, &region), Some(Overlap::Within));
        assert_eq!(overlap(&outside, &region), Some(Overlap::Disjoint));
        assert_eq!(overlap(&straddling, &region), Some(Overlap::Partial));
    }

    #[test]
    fn boundary_contact_only_keeps_points() {
        let region = square(0.0, 0.0, 10.0);
        let neighbour = Geometry::MultiPolygon(square(10.0, 0.0, 5.0));
        let on_edge = Geometry::Point(Point::new(10.0, 5.0));
        assert_eq!(overlap(&neighbour, &region), Some(Overlap::Disjoint));
        assert_eq!(overlap(&on_edge, &region), Some(Overlap::Within));
        assert_eq!(clip(&on_edge, &region), on_edge);
    }
}
