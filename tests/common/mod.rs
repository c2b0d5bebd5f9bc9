#![allow(dead_code)]

use geo::{LineString, MultiPolygon, Polygon};
use histbeam::memory::{HistoryBuilder, MemoryCellIterator, MemoryCellStore};
use histbeam::{
    Backend, Cluster, DistributedBackend, EngineConfig, LocalParallelBackend, SequentialBackend,
    Timestamps,
};
use std::sync::Arc;

pub fn ring(x0: f64, y0: f64, size: f64) -> Vec<(f64, f64)> {
    vec![
        (x0, y0),
        (x0 + size, y0),
        (x0 + size, y0 + size),
        (x0, y0 + size),
        (x0, y0),
    ]
}

pub fn square(x0: f64, y0: f64, size: f64) -> MultiPolygon<f64> {
    let exterior = LineString::from(ring(x0, y0, size));
    MultiPolygon::new(vec![Polygon::new(exterior, Vec::new())])
}

/// Five entities, each in a grid cell of its own.
///
/// | entity  | edits                                              |
/// |---------|----------------------------------------------------|
/// | node 1  | cafe at 100, renamed at 300                        |
/// | node 2  | bench at 150, deleted at 350                       |
/// | way 10  | building at 120, enlarged at 250                   |
/// | way 11  | residential road at 200                            |
/// | way 12  | house at 400                                       |
pub fn town() -> MemoryCellStore {
    let mut store = MemoryCellStore::default();
    store.insert(
        HistoryBuilder::node(1)
            .point(100, &[("amenity", "cafe")], (8.05, 49.05))
            .point(300, &[("amenity", "cafe"), ("name", "Alte Bruecke")], (8.05, 49.05))
            .build(),
    );
    store.insert(
        HistoryBuilder::node(2)
            .point(150, &[("amenity", "bench")], (9.05, 49.05))
            .deleted(350)
            .build(),
    );
    store.insert(
        HistoryBuilder::way(10)
            .line(120, &[("building", "yes")], &ring(10.05, 49.05, 0.01))
            .line(250, &[("building", "yes")], &ring(10.05, 49.05, 0.02))
            .build(),
    );
    store.insert(
        HistoryBuilder::way(11)
            .line(
                200,
                &[("highway", "residential")],
                &[(11.05, 49.05), (11.08, 49.08)],
            )
            .build(),
    );
    store.insert(
        HistoryBuilder::way(12)
            .line(400, &[("building", "house")], &ring(12.05, 49.05, 0.01))
            .build(),
    );
    store
}

pub fn every_hundred() -> Timestamps {
    Timestamps::new([100, 200, 300, 400, 500]).unwrap()
}

pub fn sequential(store: Arc<MemoryCellStore>) -> Arc<dyn Backend> {
    Arc::new(SequentialBackend::new(store, Arc::new(MemoryCellIterator)))
}

pub fn local_parallel(store: Arc<MemoryCellStore>) -> Arc<dyn Backend> {
    Arc::new(
        LocalParallelBackend::new(store, Arc::new(MemoryCellIterator))
            .with_config(EngineConfig::default().with_threads(2))
            .unwrap(),
    )
}

pub fn distributed(store: Arc<MemoryCellStore>, nodes: usize) -> Arc<dyn Backend> {
    let cluster = Arc::new(Cluster::new(store, nodes, 8));
    Arc::new(DistributedBackend::new(cluster, Arc::new(MemoryCellIterator)))
}

/// One of each backend over the same store.
pub fn all_backends(store: &Arc<MemoryCellStore>) -> Vec<Arc<dyn Backend>> {
    vec![
        sequential(Arc::clone(store)),
        local_parallel(Arc::clone(store)),
        distributed(Arc::clone(store), 3),
    ]
}
