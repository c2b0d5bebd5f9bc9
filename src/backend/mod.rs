//! Execution backends.
//!
//! A backend realizes the abstract "scan these cells, run the pipeline on what
//! they contain, fold the results" operation against some physical placement of
//! the cells. The query layer hands it:
//!
//! - a [`CellQuery`]: which cells to look at and how to iterate them,
//! - a [`Mapper`] (one output per item) or a [`FlatMapper`] (any number of
//!   outputs per entity history),
//! - a [`ReduceFns`] triple with type-erased identity, accumulator and combiner.
//!
//! That gives two reduce entry points per view and two views, plus the matching
//! stream entry points. Backends that cannot stream lazily inherit a fallback
//! that reduces into a buffer first.
//!
//! Three strategies ship with the crate:
//!
//! - [`SequentialBackend`]: one thread, cell after cell, one running accumulator.
//! - [`LocalParallelBackend`]: rayon over the locally owned cells, cooperative
//!   cancellation, best-effort partial results.
//! - [`DistributedBackend`]: one job per cluster node, streaming merge of node
//!   results at the coordinator, hard timeout.

mod cluster;
mod distributed;
mod local_parallel;
mod sequential;

pub use cluster::{Cluster, ClusterNode};
pub use distributed::DistributedBackend;
pub use local_parallel::LocalParallelBackend;
pub use sequential::SequentialBackend;

pub use crate::type_token::{Acc, Item};

use crate::collaborator::{CellIterator, CellStore, IterationContext};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::filter::FilterExpression;
use crate::grid::{CellIdRange, CellKey};
use crate::osm::GridCell;
use crate::type_token::{boxed, unbox};
use crate::view::{Contribution, Snapshot, View};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::warn;

/// Runs the whole pipeline on one root item; used when every step is a map.
pub type Mapper<R> = Arc<dyn Fn(R) -> Result<Item> + Send + Sync>;

/// Runs the pipeline on the items of one entity history.
pub type FlatMapper<R> = Arc<dyn Fn(Vec<R>) -> Result<Vec<Item>> + Send + Sync>;

/// Pull-based stream of pipeline outputs.
pub type ItemStream = Box<dyn Iterator<Item = Result<Item>> + Send>;

/// Type-erased reduce triple.
///
/// `combiner` must be associative with `identity()` as its neutral element:
/// backends fold cells in whatever order they finish.
#[derive(Clone)]
pub struct ReduceFns {
    pub identity: Arc<dyn Fn() -> Acc + Send + Sync>,
    pub accumulator: Arc<dyn Fn(Acc, Item) -> Result<Acc> + Send + Sync>,
    pub combiner: Arc<dyn Fn(Acc, Acc) -> Result<Acc> + Send + Sync>,
}

impl ReduceFns {
    /// Erase a typed reduce triple over values `X` and state `S`.
    pub fn typed<X, S, I, A, C>(identity: I, accumulator: A, combiner: C) -> Self
    where
        X: 'static,
        S: Send + 'static,
        I: Fn() -> S + Send + Sync + 'static,
        A: Fn(S, X) -> S + Send + Sync + 'static,
        C: Fn(S, S) -> S + Send + Sync + 'static,
    {
        Self {
            identity: Arc::new(move || boxed(identity())),
            accumulator: Arc::new(move |acc, item| {
                Ok(boxed(accumulator(unbox::<S>(acc)?, unbox::<X>(item)?)))
            }),
            combiner: Arc::new(move |a, b| Ok(boxed(combiner(unbox::<S>(a)?, unbox::<S>(b)?)))),
        }
    }
}

/// Buffers every output into a `Vec<Item>`.
fn collect_fns() -> ReduceFns {
    ReduceFns {
        identity: Arc::new(|| boxed(Vec::<Item>::new())),
        accumulator: Arc::new(|acc, item| {
            let mut items = unbox::<Vec<Item>>(acc)?;
            items.push(item);
            Ok(boxed(items))
        }),
        combiner: Arc::new(|a, b| {
            let mut a = unbox::<Vec<Item>>(a)?;
            a.extend(unbox::<Vec<Item>>(b)?);
            Ok(boxed(a))
        }),
    }
}

fn buffered(acc: Acc) -> Result<ItemStream> {
    let items = unbox::<Vec<Item>>(acc)?;
    Ok(Box::new(items.into_iter().map(Ok)))
}

/// Everything a backend needs to know about one query.
#[derive(Clone)]
pub struct CellQuery {
    pub context: Arc<IterationContext>,
    /// Candidate cell blocks, one per zoom level.
    pub ranges: Vec<CellIdRange>,
    /// The structured filter, re-checked on every item.
    pub root_filter: Option<Arc<FilterExpression>>,
    pub timeout: Option<Duration>,
}

impl CellQuery {
    #[must_use]
    pub fn covers(&self, key: &CellKey) -> bool {
        self.context.types.contains(key.osm_type) && self.ranges.iter().any(|r| r.contains(key.cell))
    }

    /// Keys of every cell the query has to look at, deduplicated.
    pub fn candidate_keys(&self, store: &dyn CellStore) -> Result<Vec<CellKey>> {
        let mut keys = Vec::new();
        for osm_type in self.context.types.iter() {
            for range in &self.ranges {
                keys.extend(store.cell_keys(osm_type, range)?);
            }
        }
        keys.sort_unstable();
        keys.dedup();
        Ok(keys)
    }
}

/// Iterator plus per-query iteration inputs, shared by all cells of a scan.
#[derive(Clone)]
pub struct CellSource {
    pub iterator: Arc<dyn CellIterator>,
    pub context: Arc<IterationContext>,
    pub root_filter: Option<Arc<FilterExpression>>,
}

impl CellSource {
    #[must_use]
    pub fn new(iterator: Arc<dyn CellIterator>, query: &CellQuery) -> Self {
        Self {
            iterator,
            context: Arc::clone(&query.context),
            root_filter: query.root_filter.clone(),
        }
    }
}

/// Folds the pipeline outputs of one cell into an accumulator.
pub(crate) type CellFold = Arc<dyn Fn(Acc, Arc<GridCell>) -> Result<Acc> + Send + Sync>;

/// Streams the pipeline outputs of one cell.
pub(crate) type CellScan = Arc<dyn Fn(Arc<GridCell>) -> ItemStream + Send + Sync>;

pub(crate) fn item_fold<R: View>(source: CellSource, mapper: Mapper<R>, fns: &ReduceFns) -> CellFold {
    let accumulator = Arc::clone(&fns.accumulator);
    Arc::new(move |mut acc, cell| {
        for item in R::cell_items(&source, cell) {
            acc = accumulator(acc, mapper(item?)?)?;
        }
        Ok(acc)
    })
}

pub(crate) fn entity_fold<R: View>(
    source: CellSource,
    mapper: FlatMapper<R>,
    fns: &ReduceFns,
) -> CellFold {
    let accumulator = Arc::clone(&fns.accumulator);
    Arc::new(move |mut acc, cell| {
        for group in R::cell_entity_groups(&source, cell) {
            for out in mapper(group?)? {
                acc = accumulator(acc, out)?;
            }
        }
        Ok(acc)
    })
}

pub(crate) fn item_scan<R: View>(source: CellSource, mapper: Mapper<R>) -> CellScan {
    Arc::new(move |cell| {
        let mapper = Arc::clone(&mapper);
        Box::new(R::cell_items(&source, cell).map(move |item| mapper(item?)))
    })
}

pub(crate) fn entity_scan<R: View>(source: CellSource, mapper: FlatMapper<R>) -> CellScan {
    Arc::new(move |cell| {
        let mapper = Arc::clone(&mapper);
        Box::new(
            R::cell_entity_groups(&source, cell).flat_map(move |group| -> ItemStream {
                match group.and_then(|g| mapper(g)) {
                    Ok(outputs) => Box::new(outputs.into_iter().map(Ok)),
                    Err(e) => Box::new(std::iter::once(Err(e))),
                }
            }),
        )
    })
}

/// Cooperative cancellation flag, checked once per cell.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A strategy for executing queries against stored cells.
///
/// The eight view-specific entry points are what the query layer dispatches
/// into; implementors normally route each of them into one generic scan.
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    fn config(&self) -> &EngineConfig;

    /// Whether the backend can abort a running query, and thus honor a timeout.
    fn is_cancelable(&self) -> bool {
        false
    }

    fn map_reduce_contributions(
        &self,
        query: &CellQuery,
        mapper: Mapper<Contribution>,
        fns: ReduceFns,
    ) -> Result<Acc>;

    fn flat_map_reduce_contributions_grouped_by_id(
        &self,
        query: &CellQuery,
        mapper: FlatMapper<Contribution>,
        fns: ReduceFns,
    ) -> Result<Acc>;

    fn map_reduce_snapshots(
        &self,
        query: &CellQuery,
        mapper: Mapper<Snapshot>,
        fns: ReduceFns,
    ) -> Result<Acc>;

    fn flat_map_reduce_snapshots_grouped_by_id(
        &self,
        query: &CellQuery,
        mapper: FlatMapper<Snapshot>,
        fns: ReduceFns,
    ) -> Result<Acc>;

    fn map_stream_contributions(
        &self,
        query: &CellQuery,
        mapper: Mapper<Contribution>,
    ) -> Result<ItemStream> {
        warn!(backend = self.name(), "no lazy stream support, buffering all results");
        buffered(self.map_reduce_contributions(query, mapper, collect_fns())?)
    }

    fn flat_map_stream_contributions_grouped_by_id(
        &self,
        query: &CellQuery,
        mapper: FlatMapper<Contribution>,
    ) -> Result<ItemStream> {
        warn!(backend = self.name(), "no lazy stream support, buffering all results");
        buffered(self.flat_map_reduce_contributions_grouped_by_id(query, mapper, collect_fns())?)
    }

    fn map_stream_snapshots(&self, query: &CellQuery, mapper: Mapper<Snapshot>) -> Result<ItemStream> {
        warn!(backend = self.name(), "no lazy stream support, buffering all results");
        buffered(self.map_reduce_snapshots(query, mapper, collect_fns())?)
    }

    fn flat_map_stream_snapshots_grouped_by_id(
        &self,
        query: &CellQuery,
        mapper: FlatMapper<Snapshot>,
    ) -> Result<ItemStream> {
        warn!(backend = self.name(), "no lazy stream support, buffering all results");
        buffered(self.flat_map_reduce_snapshots_grouped_by_id(query, mapper, collect_fns())?)
    }
}
