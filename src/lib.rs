//! # Histbeam
//!
//! A **map-reduce query engine** over the full edit history of OpenStreetMap data,
//! partitioned into a hierarchical grid of cells. Histbeam lets you describe what
//! to extract with a fluent builder, then runs the query cell by cell on a
//! sequential, thread-parallel or distributed backend.
//!
//! ## Key Features
//!
//! - **Two views of history** - entity states at fixed instants ([`Snapshot`]) or
//!   individual edits between them ([`Contribution`])
//! - **Declarative query builder** - `map`, `flat_map`, `filter`, `group_by_entity`
//! - **Grouped aggregation** - by custom key, by timestamp, by sub-region, nested
//! - **Built-in reductions** - count, sum, average, distinct values, t-digest quantiles
//! - **Filter language** - `building=* and type:way`, optimized into cheap pre-filters
//! - **Interchangeable backends** - same results whatever the execution strategy
//! - **Lazy geometries** - clipping only happens for items someone actually inspects
//!
//! ## Quick Start
//!
//! ```
//! use histbeam::memory::{HistoryBuilder, MemoryCellIterator, MemoryCellStore};
//! use histbeam::{SequentialBackend, SnapshotView, Timestamps};
//! use std::sync::Arc;
//!
//! # fn main() -> histbeam::Result<()> {
//! let mut store = MemoryCellStore::default();
//! store.insert(
//!     HistoryBuilder::node(1)
//!         .point(100, &[("amenity", "cafe")], (8.68, 49.41))
//!         .build(),
//! );
//! let backend = Arc::new(SequentialBackend::new(Arc::new(store), Arc::new(MemoryCellIterator)));
//!
//! let cafes = SnapshotView::on(backend)
//!     .timestamps(Timestamps::new([50, 150])?)
//!     .filter_str("amenity=cafe")?
//!     .aggregate_by_timestamp()?
//!     .count()?;
//!
//! assert_eq!(cafes.get(&50), Some(&0));
//! assert_eq!(cafes.get(&150), Some(&1));
//! # Ok(())
//! # }
//! ```
//!
//! ## Core Concepts
//!
//! ### Views
//!
//! [`SnapshotView::on`] and [`ContributionView::on`] start a query on a backend.
//! The resulting [`MapReducer`] yields every matching root item until the
//! pipeline is extended.
//!
//! ### Pipelines
//!
//! - [`map`](MapReducer::map) - transform each value
//! - [`flat_map`](MapReducer::flat_map) - zero or more outputs per value
//! - [`filter`](MapReducer::filter) - keep values matching a predicate
//! - [`group_by_entity`](MapReducer::group_by_entity) - hand whole entity histories to later steps
//!
//! A pipeline of plain maps runs on a fast path with one output per item;
//! anything else is flattened. Both produce identical results.
//!
//! ### Aggregation
//!
//! - [`aggregate_by`](MapReducer::aggregate_by) - custom key per value
//! - [`aggregate_by_timestamp`](MapReducer::aggregate_by_timestamp) - query instant or interval
//! - [`aggregate_by_geometry`](MapReducer::aggregate_by_geometry) - sub-region, with clipping
//!
//! Nested aggregations produce [`CombinedIndex`] keys. Zerofill keys appear in
//! every grouped result, holding the reduction identity when nothing matched.
//!
//! ### Backends
//!
//! - [`SequentialBackend`] - one thread, lazily streamed results
//! - [`LocalParallelBackend`] - rayon over cells, cancelable with partial results
//! - [`DistributedBackend`] - one worker per [`Cluster`] node, optional timeout
//!
//! ## Logging
//!
//! Histbeam logs through `tracing`. Call [`logging::init`] once to install a
//! subscriber honoring `RUST_LOG`.

pub mod aggregator;
pub mod backend;
pub mod collaborator;
pub mod combiners;
pub mod config;
pub mod error;
pub mod filter;
pub mod geometry;
pub mod grid;
pub mod logging;
pub mod mapreducer;
pub mod memory;
pub mod osm;
pub mod splitter;
pub mod timestamps;
pub mod type_token;
pub mod view;

mod pipeline;
mod step;

// General re-exports
pub use aggregator::{CombinedIndex, Key, MapAggregator};
pub use backend::{
    Backend, CancellationToken, Cluster, ClusterNode, DistributedBackend, LocalParallelBackend,
    SequentialBackend,
};
pub use collaborator::{CellIterator, CellStore, DefaultTagInterpreter, TagInterpreter};
pub use combiners::{CombineFn, TDigest, WeightedValue};
pub use config::EngineConfig;
pub use error::{Error, Result};
pub use filter::FilterExpression;
pub use geometry::LazyGeometry;
pub use grid::{CellId, CellKey};
pub use mapreducer::{AreaOfInterest, ExecPath, MapReducer, ResultStream};
pub use osm::{EntityHistory, OsmEntity, OsmType, OsmTypeSet};
pub use pipeline::Grouping;
pub use splitter::GeometrySplitter;
pub use timestamps::{TimestampMs, Timestamps};
pub use view::{
    Contribution, ContributionType, ContributionTypes, ContributionView, EntityState, Snapshot,
    SnapshotView, View,
};
