//! Built-in combiners for terminal reductions.
//!
//! A [`CombineFn`] packages the reduce contract (create / add / merge) together
//! with a final projection, so a single value can drive both scalar terminals
//! (`MapReducer::combine`) and per-key terminals (`MapAggregator::combine`):
//!
//! - [`Count`] -- number of values.
//! - [`Sum<T>`] -- sum of values.
//! - [`AverageF64`] -- arithmetic mean as `f64` (`NaN` when empty).
//! - [`WeightedAverage`] -- mean of [`WeightedValue`]s.
//! - [`DistinctSet<T>`] / [`DistinctCount<T>`] -- distinct values and their count.
//! - [`Collect<T>`] -- every value, in no particular order.
//! - [`ApproxQuantiles<V>`] / [`ApproxMedian<V>`] -- t-digest based estimates.
//!
//! Every combiner must keep `merge` associative with `create()` as its neutral
//! element; results are merged in whatever order cells and partitions finish.

mod basic;
mod collect;
mod distinct;
mod quantiles;
mod statistical;

pub use basic::{Count, Sum};
pub use collect::Collect;
pub use distinct::{DistinctCount, DistinctSet};
pub use quantiles::{ApproxMedian, ApproxQuantiles, TDigest};
pub use statistical::{AverageF64, WeightedAverage, WeightedValue};

/// A reusable reduction from values `V` over an accumulator `A` to an output `O`.
pub trait CombineFn<V, A, O>: Send + Sync + 'static {
    fn create(&self) -> A;
    fn add_input(&self, acc: &mut A, v: V);
    fn merge(&self, acc: &mut A, other: A);
    fn finish(&self, acc: A) -> O;
}
