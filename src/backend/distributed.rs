use super::local_parallel::scan_node;
use super::{
    Acc, Backend, CancellationToken, CellFold, CellQuery, CellSource, Cluster, FlatMapper, Mapper,
    ReduceFns, entity_fold, item_fold,
};
use crate::collaborator::CellIterator;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::view::{Contribution, Snapshot};
use anyhow::anyhow;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Scatter/gather over a [`Cluster`].
///
/// Every node runs the partition-parallel scan over the cells it owns on its
/// own worker thread. The coordinator merges node results as they arrive. When
/// the query has a deadline and it passes first, the job is canceled and the
/// query fails with [`Error::Timeout`]; no partial result is returned.
pub struct DistributedBackend {
    cluster: Arc<Cluster>,
    iterator: Arc<dyn CellIterator>,
    config: EngineConfig,
}

impl DistributedBackend {
    pub fn new(cluster: Arc<Cluster>, iterator: Arc<dyn CellIterator>) -> Self {
        Self {
            cluster,
            iterator,
            config: EngineConfig::default(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    fn source(&self, query: &CellQuery) -> CellSource {
        CellSource::new(Arc::clone(&self.iterator), query)
    }

    fn run(&self, query: &CellQuery, fold: CellFold, fns: &ReduceFns) -> Result<Acc> {
        let job = CancellationToken::new();
        let deadline = query.timeout.map(|t| Instant::now() + t);
        let (tx, rx) = mpsc::channel::<(usize, Result<Acc>)>();

        for node in self.cluster.nodes() {
            let node = Arc::clone(node);
            let tx = tx.clone();
            let query = query.clone();
            let fold = Arc::clone(&fold);
            let fns = fns.clone();
            let node_job = job.clone();
            thread::Builder::new()
                .name(format!("histbeam-node-{}", node.index()))
                .spawn(move || {
                    let result = scan_node(&node, &query, &fold, &fns, &node_job, None);
                    // The coordinator may have given up already.
                    let _ = tx.send((node.index(), result));
                })
                .map_err(|e| {
                    job.cancel();
                    Error::Collaborator(anyhow!(e).context("spawning node worker"))
                })?;
        }
        drop(tx);

        let mut pending = self.cluster.nodes().len();
        info!(backend = self.name(), nodes = pending, "job broadcast");
        let mut acc = (fns.identity)();
        while pending > 0 {
            let received = match deadline {
                Some(d) => rx.recv_timeout(d.saturating_duration_since(Instant::now())),
                None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };
            match received {
                Ok((index, Ok(partial))) => {
                    pending -= 1;
                    debug!(node = index, pending, "node result merged");
                    acc = (fns.combiner)(acc, partial).inspect_err(|_| job.cancel())?;
                    if pending > 0 && deadline.is_some_and(|d| Instant::now() >= d) {
                        return Err(self.time_out(&job, query));
                    }
                }
                Ok((index, Err(e))) => {
                    job.cancel();
                    warn!(node = index, error = %e, "node failed, canceling job");
                    return Err(e);
                }
                Err(RecvTimeoutError::Timeout) => return Err(self.time_out(&job, query)),
                Err(RecvTimeoutError::Disconnected) => {
                    job.cancel();
                    return Err(Error::Collaborator(anyhow!(
                        "{pending} node worker(s) exited without a result"
                    )));
                }
            }
        }
        Ok(acc)
    }

    fn time_out(&self, job: &CancellationToken, query: &CellQuery) -> Error {
        job.cancel();
        let limit = query.timeout.unwrap_or_default();
        warn!(backend = self.name(), ?limit, "deadline passed, job canceled");
        Error::Timeout(limit)
    }
}

impl Backend for DistributedBackend {
    fn name(&self) -> &'static str {
        "distributed"
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
