use super::{
    Acc, Backend, CancellationToken, CellFold, CellQuery, CellSource, ClusterNode, FlatMapper,
    Mapper, ReduceFns, entity_fold, item_fold,
};
use crate::collaborator::{CellIterator, CellStore};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::view::{Contribution, Snapshot};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Fold every locally owned cell of `query` in parallel.
///
/// `cancel` and `deadline` are checked before each cell; once either trips,
/// remaining cells contribute `identity()` only.
pub(crate) fn scan_node(
    node: &ClusterNode,
    query: &CellQuery,
    fold: &CellFold,
    fns: &ReduceFns,
    cancel: &CancellationToken,
    deadline: Option<Instant>,
) -> Result<Acc> {
    let keys = node.local_cells(query)?;
    debug!(node = node.index(), cells = keys.len(), "scanning local cells");
    keys.par_iter()
        .map(|key| {
            if cancel.is_canceled() || deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok((fns.identity)());
            }
            match node.get_cell(*key)? {
                Some(cell) => fold((fns.identity)(), cell),
                None => Ok((fns.identity)()),
            }
        })
        .try_reduce(|| (fns.identity)(), |a, b| (fns.combiner)(a, b))
}

/// Partition-parallel scan over the cells one node owns.
///
/// Honors query timeouts and an external [`CancellationToken`]; either way the
/// result folded so far is returned instead of an error.
pub struct LocalParallelBackend {
    node: Arc<ClusterNode>,
    iterator: Arc<dyn CellIterator>,
    config: EngineConfig,
    pool: Option<Arc<ThreadPool>>,
    cancel: CancellationToken,
}

impl LocalParallelBackend {
    /// Scan every cell of `store` (a single node owning all partitions).
    pub fn new(store: Arc<dyn CellStore>, iterator: Arc<dyn CellIterator>) -> Self {
        Self::on_node(Arc::new(ClusterNode::solo(store)), iterator)
    }

    /// Scan only the cells `node` owns.
    pub fn on_node(node: Arc<ClusterNode>, iterator: Arc<dyn CellIterator>) -> Self {
        Self {
            node,
            iterator,
            config: EngineConfig::default(),
            pool: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Apply `config`, building a dedicated thread pool when it sets `threads`.
    pub fn with_config(mut self, config: EngineConfig) -> Result<Self> {
        self.pool = match config.threads {
            Some(threads) => Some(Arc::new(
                ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .thread_name(|i| format!("histbeam-scan-{i}"))
                    .build()
                    .map_err(|e| Error::config(format!("cannot build scan thread pool: {e}")))?,
            )),
            None => None,
        };
        self.config = config;
        Ok(self)
    }

    /// Share `token` for external cancellation. A canceled backend stays canceled.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn source(&self, query: &CellQuery) -> CellSource {
        CellSource::new(Arc::clone(&self.iterator), query)
    }

    fn run(&self, query: &CellQuery, fold: CellFold, fns: &ReduceFns) -> Result<Acc> {
        let deadline = query.timeout.map(|t| Instant::now() + t);
        let scan = || scan_node(&self.node, query, &fold, fns, &self.cancel, deadline);
        let acc = match &self.pool {
            Some(pool) => pool.install(scan)?,
            None => scan()?,
        };
        if self.cancel.is_canceled() {
            warn!(backend = self.name(), "query canceled, returning partial result");
        } else if deadline.is_some_and(|d| Instant::now() >= d) {
            warn!(backend = self.name(), "query deadline passed, returning partial result");
        }
        Ok(acc)
    }
}

impl Backend for LocalParallelBackend {
    fn name(&self) -> &'static str {
        "local-parallel"
    }

    fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn is_cancelable(&self) -> bool {
        true
    }

    fn map_reduce_contributions(
        &self,
        query: &CellQuery,
        mapper: Mapper<Contribution>,
        fns: ReduceFns,
    ) -> Result<Acc> {
        self.run(query, item_fold(self.source(query), mapper, &fns), &fns)
    }

    fn flat_map_reduce_contributions_grouped_by_id(
        &self,
        query: &CellQuery,
        mapper: FlatMapper<Contribution>,
        fns: ReduceFns,
    ) -> Result<Acc> {
        self.run(query, entity_fold(self.source(query), mapper, &fns), &fns)
    }

    fn map_reduce_snapshots(
        &self,
        query: &CellQuery,
        mapper: Mapper<Snapshot>,
        fns: ReduceFns,
    ) -> Result<Acc> {
        self.run(query, item_fold(self.source(query), mapper, &fns), &fns)
    }

    fn flat_map_reduce_snapshots_grouped_by_id(
        &self,
        query: &CellQuery,
        mapper: FlatMapper<Snapshot>,
        fns: ReduceFns,
    ) -> Result<Acc> {
        self.run(query, entity_fold(self.source(query), mapper, &fns), &fns)
    }
}
