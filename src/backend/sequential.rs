use super::{
    Acc, Backend, CellFold, CellQuery, CellScan, CellSource, FlatMapper, ItemStream, Mapper,
    ReduceFns, entity_fold, entity_scan, item_fold, item_scan,
};
use crate::collaborator::{CellIterator, CellStore};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::view::{Contribution, Snapshot};
use std::sync::Arc;
use tracing::debug;

/// Single-threaded scan: fetch each candidate cell in turn and fold it into
/// one running accumulator.
///
/// The only backend with lazy streams: `stream()` pulls one cell at a time.
/// It cannot be canceled, so query timeouts are ignored.
pub struct SequentialBackend {
    store: Arc<dyn CellStore>,
    iterator: Arc<dyn CellIterator>,
    config: EngineConfig,
}

impl SequentialBackend {
    pub fn new(store: Arc<dyn CellStore>, iterator: Arc<dyn CellIterator>) -> Self {
        Self {
            store,
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
        let keys = query.candidate_keys(self.store.as_ref())?;
        debug!(backend = self.name(), cells = keys.len(), "scanning cells");
        let mut acc = (fns.identity)();
        for key in keys {
            if let Some(cell) = self.store.get_cell(key)? {
                acc = fold(acc, cell)?;
            }
        }
        (fns.combiner)((fns.identity)(), acc)
    }

    fn stream(&self, query: &CellQuery, scan: CellScan) -> Result<ItemStream> {
        let keys = query.candidate_keys(self.store.as_ref())?;
        debug!(backend = self.name(), cells = keys.len(), "streaming cells");
        let store = Arc::clone(&self.store);
        Ok(Box::new(keys.into_iter().flat_map(move |key| -> ItemStream {
            match store.get_cell(key) {
                Ok(Some(cell)) => scan(cell),
                Ok(None) => Box::new(std::iter::empty()),
                Err(e) => Box::new(std::iter::once(Err(e.into()))),
            }
        })))
    }
}

impl Backend for SequentialBackend {
    fn name(&self) -> &'static str {
        "sequential"
    }

    fn config(&self) -> &EngineConfig {
        &self.config
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

    fn map_stream_contributions(
        &self,
        query: &CellQuery,
        mapper: Mapper<Contribution>,
    ) -> Result<ItemStream> {
        self.stream(query, item_scan(self.source(query), mapper))
    }

    fn flat_map_stream_contributions_grouped_by_id(
        &self,
        query: &CellQuery,
        mapper: FlatMapper<Contribution>,
    ) -> Result<ItemStream> {
        self.stream(query, entity_scan(self.source(query), mapper))
    }

    fn map_stream_snapshots(&self, query: &CellQuery, mapper: Mapper<Snapshot>) -> Result<ItemStream> {
        self.stream(query, item_scan(self.source(query), mapper))
    }

    fn flat_map_stream_snapshots_grouped_by_id(
        &self,
        query: &CellQuery,
        mapper: FlatMapper<Snapshot>,
    ) -> Result<ItemStream> {
        self.stream(query, entity_scan(self.source(query), mapper))
    }
}
