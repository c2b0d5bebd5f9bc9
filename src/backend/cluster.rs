//! In-process model of a partitioned cell cache.
//!
//! Cells are hashed into a fixed number of partitions and partitions are dealt
//! round-robin to nodes. A node only ever reads the cells of the partitions it
//! owns, which is what lets the parallel scan run without any network hop and
//! the distributed backend split one query into disjoint per-node jobs.

use super::CellQuery;
use crate::collaborator::CellStore;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::grid::CellKey;
use crate::osm::GridCell;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;

fn partition_of(key: &CellKey, partitions: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    #[allow(clippy::cast_possible_truncation)]
    let slot = hasher.finish() as usize;
    slot % partitions
}

/// One owner of a subset of the partitions.
pub struct ClusterNode {
    index: usize,
    nodes: usize,
    partitions: usize,
    store: Arc<dyn CellStore>,
}

impl ClusterNode {
    /// A node that owns every partition.
    pub fn solo(store: Arc<dyn CellStore>) -> Self {
        Self {
            index: 0,
            nodes: 1,
            partitions: 1,
            store,
        }
    }

    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    #[must_use]
    pub fn owns(&self, key: &CellKey) -> bool {
        partition_of(key, self.partitions) % self.nodes == self.index
    }

    /// Candidate cells of `query` that live on this node.
    pub fn local_cells(&self, query: &CellQuery) -> Result<Vec<CellKey>> {
        let mut keys = query.candidate_keys(self.store.as_ref())?;
        keys.retain(|k| self.owns(k));
        Ok(keys)
    }

    pub fn get_cell(&self, key: CellKey) -> Result<Option<Arc<GridCell>>> {
        Ok(self.store.get_cell(key)?)
    }
}

/// A fixed set of nodes sharing one partitioning.
pub struct Cluster {
    nodes: Vec<Arc<ClusterNode>>,
    partitions: usize,
}

impl Cluster {
    /// `nodes` owners over `partitions` partitions, both at least one.
    pub fn new(store: Arc<dyn CellStore>, nodes: usize, partitions: usize) -> Self {
        let nodes = nodes.max(1);
        let partitions = partitions.max(1);
        Self {
            nodes: (0..nodes)
                .map(|index| {
                    Arc::new(ClusterNode {
                        index,
                        nodes,
                        partitions,
                        store: Arc::clone(&store),
                    })
                })
                .collect(),
            partitions,
        }
    }

    /// A cluster partitioned as `config.partitions` says.
    pub fn from_config(store: Arc<dyn CellStore>, nodes: usize, config: &EngineConfig) -> Self {
        Self::new(store, nodes, config.partitions)
    }

    #[must_use]
    pub fn nodes(&self) -> &[Arc<ClusterNode>] {
        &self.nodes
    }

    #[must_use]
    pub fn partitions(&self) -> usize {
        self.partitions
    }

    /// Index of the node owning `key`.
    #[must_use]
    pub fn owner_of(&self, key: &CellKey) -> usize {
        partition_of(key, self.partitions) % self.nodes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::CellId;
    use crate::osm::OsmType;

    struct NoCells;

    impl CellStore for NoCells {
        fn get_cell(&self, _key: CellKey) -> anyhow::Result<Option<Arc<GridCell>>> {
            Ok(None)
        }
    }

    #[test]
    fn every_key_has_exactly_one_owner() {
        let cluster = Cluster::new(Arc::new(NoCells), 3, 16);
        for id in 0..200 {
            let key = CellKey {
                osm_type: OsmType::Way,
                cell: CellId { zoom: 8, id },
            };
            let owners: Vec<usize> = cluster
                .nodes()
                .iter()
                .filter(|n| n.owns(&key))
                .map(|n| n.index())
                .collect();
            assert_eq!(owners, vec![cluster.owner_of(&key)]);
        }
    }
}
