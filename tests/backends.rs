mod common;

use common::*;
use histbeam::collaborator::{ContributionIter, IterationContext, SnapshotIter};
use histbeam::memory::{HistoryBuilder, MemoryCellIterator, MemoryCellStore};
use histbeam::osm::GridCell;
use histbeam::{
    CancellationToken, CellIterator, Cluster, Contribution, ContributionView, DistributedBackend,
    EngineConfig, Error, LocalParallelBackend, OsmType, SequentialBackend, Snapshot, SnapshotView,
    Timestamps,
};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Sleeps before handing out each cell.
struct SlowIterator(Duration);

impl CellIterator for SlowIterator {
    fn iterate_all(&self, cell: Arc<GridCell>, context: Arc<IterationContext>) -> ContributionIter {
        thread::sleep(self.0);
        MemoryCellIterator.iterate_all(cell, context)
    }

    fn iterate_by_timestamps(
        &self,
        cell: Arc<GridCell>,
        context: Arc<IterationContext>,
    ) -> SnapshotIter {
        thread::sleep(self.0);
        MemoryCellIterator.iterate_by_timestamps(cell, context)
    }
}

/// Cancels a token as soon as the first cell is read.
struct CancelOnFirstCell(CancellationToken);

impl CellIterator for CancelOnFirstCell {
    fn iterate_all(&self, cell: Arc<GridCell>, context: Arc<IterationContext>) -> ContributionIter {
        self.0.cancel();
        MemoryCellIterator.iterate_all(cell, context)
    }

    fn iterate_by_timestamps(
        &self,
        cell: Arc<GridCell>,
        context: Arc<IterationContext>,
    ) -> SnapshotIter {
        self.0.cancel();
        MemoryCellIterator.iterate_by_timestamps(cell, context)
    }
}

/// Twenty nodes, each in its own cell.
fn scattered() -> MemoryCellStore {
    let mut store = MemoryCellStore::default();
    for i in 0..20 {
        store.insert(
            HistoryBuilder::node(i)
                .point(100, &[("amenity", "bench")], (-170.0 + 15.0 * i as f64, 10.0))
                .build(),
        );
    }
    store
}

#[test]
fn backends_agree_on_snapshots() -> anyhow::Result<()> {
    let store = Arc::new(town());
    let mut results = Vec::new();
    for backend in all_backends(&store) {
        let query = SnapshotView::on(backend).timestamps(every_hundred());
        results.push((
            query.aggregate_by_timestamp()?.count()?,
            query
                .aggregate_by(|s: &Snapshot| s.entity().osm_type)
                .map(|s: &Snapshot| s.entity().id)
                .sum()?,
            query.group_by_entity()?.count()?,
        ));
    }
    assert!(results.windows(2).all(|w| w[0] == w[1]), "{results:?}");
    Ok(())
}

#[test]
fn backends_agree_on_contributions() -> anyhow::Result<()> {
    let store = Arc::new(town());
    let mut results = Vec::new();
    for backend in all_backends(&store) {
        let query = ContributionView::on(backend).timestamps(every_hundred());
        let mut edits = query
            .filter(|c: &Contribution| c.entity_after().is_some())
            .map(|c: &Contribution| (c.timestamp(), c.changeset_id()))
            .collect()?;
        edits.sort_unstable();
        results.push((query.aggregate_by_timestamp()?.count()?, edits));
    }
    assert!(results.windows(2).all(|w| w[0] == w[1]), "{results:?}");
    Ok(())
}

#[test]
fn node_count_does_not_change_results() -> anyhow::Result<()> {
    let store = Arc::new(scattered());
    for nodes in 1..=4 {
        let count = SnapshotView::on(distributed(Arc::clone(&store), nodes))
            .timestamps(Timestamps::single(100))
            .count()?;
        assert_eq!(count, 20, "{nodes} node(s)");
    }
    Ok(())
}

#[test]
fn canceled_parallel_scan_returns_a_partial_result() -> anyhow::Result<()> {
    let store = Arc::new(scattered());
    let token = CancellationToken::new();
    let backend = LocalParallelBackend::new(store, Arc::new(CancelOnFirstCell(token.clone())))
        .with_config(EngineConfig::default().with_threads(1))?
        .with_cancellation(token.clone());
    let count = SnapshotView::on(Arc::new(backend))
        .timestamps(Timestamps::single(100))
        .count()?;
    assert!(token.is_canceled());
    assert_eq!(count, 1);
    Ok(())
}

#[test]
fn parallel_scan_finishes_within_a_generous_timeout() -> anyhow::Result<()> {
    let store = Arc::new(scattered());
    let count = SnapshotView::on(local_parallel(store))
        .timestamps(Timestamps::single(100))
        .timeout(Duration::from_secs(60))
        .count()?;
    assert_eq!(count, 20);
    Ok(())
}

#[test]
fn expired_parallel_deadline_returns_a_partial_result() -> anyhow::Result<()> {
    let store = Arc::new(scattered());
    let backend = LocalParallelBackend::new(store, Arc::new(SlowIterator(Duration::from_millis(50))))
        .with_config(EngineConfig::default().with_threads(2))?;
    let count = SnapshotView::on(Arc::new(backend))
        .timestamps(Timestamps::single(100))
        .timeout(Duration::from_millis(20))
        .count()?;
    assert!(count < 20, "{count}");
    Ok(())
}

#[test]
fn distributed_query_times_out() {
    let store: Arc<MemoryCellStore> = Arc::new(scattered());
    let cluster = Arc::new(Cluster::new(store, 2, 4));
    let backend = DistributedBackend::new(cluster, Arc::new(SlowIterator(Duration::from_millis(200))));
    let result = SnapshotView::on(Arc::new(backend))
        .timestamps(Timestamps::single(100))
        .timeout(Duration::from_millis(20))
        .count();
    assert!(matches!(result, Err(Error::Timeout(_))));
}

#[test]
fn configured_timeout_applies_by_default() {
    let store: Arc<MemoryCellStore> = Arc::new(scattered());
    let cluster = Arc::new(Cluster::new(store, 2, 4));
    let config = EngineConfig::default().with_timeout(Duration::from_millis(20));
    let backend = DistributedBackend::new(cluster, Arc::new(SlowIterator(Duration::from_millis(200))))
        .with_config(config);
    let result = SnapshotView::on(Arc::new(backend))
        .timestamps(Timestamps::single(100))
        .count();
    assert!(matches!(result, Err(Error::Timeout(_))));
}

#[test]
fn sequential_scan_ignores_timeouts() -> anyhow::Result<()> {
    let store = Arc::new(scattered());
    let backend = SequentialBackend::new(store, Arc::new(SlowIterator(Duration::from_millis(2))));
    let count = SnapshotView::on(Arc::new(backend))
        .timestamps(Timestamps::single(100))
        .timeout(Duration::from_millis(1))
        .count()?;
    assert_eq!(count, 20);
    Ok(())
}

#[test]
fn sequential_streams_are_lazy() -> anyhow::Result<()> {
    let store = Arc::new(scattered());
    let backend = sequential(Arc::clone(&store));
    let mut stream = SnapshotView::on(backend)
        .timestamps(Timestamps::single(100))
        .map(|s: &Snapshot| s.entity().id)
        .stream()?;
    assert!(stream.next().transpose()?.is_some());
    assert_eq!(store.fetch_count(), 1);
    assert_eq!(stream.count(), 19);
    assert_eq!(store.fetch_count(), 20);
    Ok(())
}

#[test]
fn other_backends_buffer_streams() -> anyhow::Result<()> {
    let store = Arc::new(town());
    for backend in [local_parallel(Arc::clone(&store)), distributed(Arc::clone(&store), 2)] {
        let mut ids = SnapshotView::on(backend)
            .timestamps(Timestamps::single(500))
            .osm_types(histbeam::OsmTypeSet::of(OsmType::Way))
            .map(|s: &Snapshot| s.entity().id)
            .stream()?
            .collect::<histbeam::Result<Vec<_>>>()?;
        ids.sort_unstable();
        assert_eq!(ids, vec![10, 11, 12]);
    }
    Ok(())
}

#[test]
fn grouped_streams_yield_one_value_per_entity() -> anyhow::Result<()> {
    let backend = sequential(Arc::new(town()));
    let sizes = ContributionView::on(backend)
        .timestamps(every_hundred())
        .group_by_entity()?
        .map(|edits: &Vec<Contribution>| edits.len())
        .stream()?
        .collect::<histbeam::Result<Vec<_>>>()?;
    assert_eq!(sizes.iter().sum::<usize>(), 8);
    assert_eq!(sizes.len(), 5);
    Ok(())
}
