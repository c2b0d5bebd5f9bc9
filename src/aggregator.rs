//! Keyed queries.
//!
//! A [`MapAggregator<R, U, X>`] is a [`MapReducer`] whose values travel together
//! with an aggregation key `U`. Terminals fold one accumulator per key and
//! return a `BTreeMap<U, _>`. Keys listed as zero-fill (every query instant for
//! timestamp aggregation, every region for geometry aggregation) appear in the
//! result with the empty accumulator even when nothing mapped to them.
//!
//! Chaining another `aggregate_by*` call nests the keys into a
//! [`CombinedIndex`]. A nested result is filled with the cartesian product of
//! every level's keys, where a level's keys are its zero-fill list plus the
//! keys observed on that level.

use crate::combiners::{
    ApproxMedian, ApproxQuantiles, AverageF64, Collect, CombineFn, Count, DistinctCount,
    DistinctSet, Sum, WeightedAverage, WeightedValue,
};
use crate::error::Result;
use crate::mapreducer::{MapReducer, ResultStream};
use crate::splitter::GeometrySplitter;
use crate::step::Step;
use crate::timestamps::TimestampMs;
use crate::type_token::Data;
use crate::view::View;
use geo::MultiPolygon;
use serde::{Deserialize, Serialize};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt::Debug;
use std::hash::Hash;
use std::ops::Add;
use std::sync::Arc;

/// Bound for aggregation keys.
pub trait Key: Ord + Clone + Debug + Send + Sync + 'static {}
impl<T> Key for T where T: Ord + Clone + Debug + Send + Sync + 'static {}

/// Two-level aggregation key.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CombinedIndex<U, V> {
    pub first: U,
    pub second: V,
}

impl<U, V> CombinedIndex<U, V> {
    #[must_use]
    pub const fn new(first: U, second: V) -> Self {
        Self { first, second }
    }

    /// Regroup a combined-key result as `first -> second -> value`.
    #[must_use]
    pub fn nest<A>(result: BTreeMap<Self, A>) -> BTreeMap<U, BTreeMap<V, A>>
    where
        U: Ord,
        V: Ord,
    {
        let mut nested: BTreeMap<U, BTreeMap<V, A>> = BTreeMap::new();
        for (key, value) in result {
            nested.entry(key.first).or_default().insert(key.second, value);
        }
        nested
    }
}

impl<U, V> From<(U, V)> for CombinedIndex<U, V> {
    fn from((first, second): (U, V)) -> Self {
        Self::new(first, second)
    }
}

fn cartesian<U: Key, V: Key>(left: &BTreeSet<U>, right: &BTreeSet<V>) -> BTreeSet<CombinedIndex<U, V>> {
    left.iter()
        .flat_map(|u| right.iter().map(move |v| CombinedIndex::new(u.clone(), v.clone())))
        .collect()
}

/// Keys a result must hold, given the keys that were observed.
type FillFn<U> = Arc<dyn Fn(&BTreeSet<U>) -> BTreeSet<U> + Send + Sync>;

fn level_fill<U: Key>(declared: impl IntoIterator<Item = U>) -> FillFn<U> {
    let declared: BTreeSet<U> = declared.into_iter().collect();
    Arc::new(move |observed: &BTreeSet<U>| declared.union(observed).cloned().collect::<BTreeSet<U>>())
}

fn nested_fill<U: Key, V: Key>(outer: FillFn<U>, inner: FillFn<V>) -> FillFn<CombinedIndex<U, V>> {
    Arc::new(move |observed: &BTreeSet<CombinedIndex<U, V>>| {
        let firsts: BTreeSet<U> = observed.iter().map(|k| k.first.clone()).collect();
        let seconds: BTreeSet<V> = observed.iter().map(|k| k.second.clone()).collect();
        cartesian(&outer(&firsts), &inner(&seconds))
    })
}

/// A query whose values carry an aggregation key `U`.
pub struct MapAggregator<R: View, U: Key, X> {
    inner: MapReducer<R, (U, X)>,
    fill: FillFn<U>,
}

impl<R: View, U: Key, X> Clone for MapAggregator<R, U, X> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            fill: Arc::clone(&self.fill),
        }
    }
}

impl<R: View, U: Key> MapAggregator<R, U, R> {
    /// Further split by sub-region; keys become `(U, region)`.
    pub fn aggregate_by_geometry<V, G, I>(
        &self,
        regions: I,
    ) -> Result<MapAggregator<R, CombinedIndex<U, V>, R>>
    where
        V: Key,
        G: Into<MultiPolygon<f64>>,
        I: IntoIterator<Item = (V, G)>,
    {
        self.inner.require_ungrouped("aggregate_by_geometry")?;
        let splitter = Arc::new(GeometrySplitter::new(regions));
        let fill = nested_fill(Arc::clone(&self.fill), level_fill(splitter.keys()));
        let split = self.inner.with_step(Step::flat_map(move |(u, r): (U, R)| {
            Ok(r.split_by(&splitter)
                .into_iter()
                .map(|(v, piece)| (CombinedIndex::new(u.clone(), v), piece))
                .collect::<Vec<_>>())
        }));
        Ok(MapAggregator { inner: split, fill })
    }
}

impl<R: View, U: Key, X: Data> MapAggregator<R, U, X> {
    pub(crate) fn new(inner: MapReducer<R, (U, X)>, zerofill: Vec<U>) -> Self {
        Self {
            inner,
            fill: level_fill(zerofill),
        }
    }

    /// Every key a result holds when `observed` keys received values.
    fn filled_keys(&self, observed: impl Iterator<Item = U>) -> BTreeSet<U> {
        let observed: BTreeSet<U> = observed.collect();
        (self.fill)(&observed)
    }

    #[must_use]
    pub fn map<Y, F>(&self, f: F) -> MapAggregator<R, U, Y>
    where
        Y: Data,
        F: Fn(&X) -> Y + Send + Sync + 'static,
    {
        MapAggregator {
            inner: self.inner.with_step(Step::map(move |(u, x): (U, X)| Ok((u, f(&x))))),
            fill: Arc::clone(&self.fill),
        }
    }

    #[must_use]
    pub fn flat_map<Y, F>(&self, f: F) -> MapAggregator<R, U, Y>
    where
        Y: Data,
        F: Fn(&X) -> Vec<Y> + Send + Sync + 'static,
    {
        MapAggregator {
            inner: self.inner.with_step(Step::flat_map(move |(u, x): (U, X)| {
                Ok(f(&x).into_iter().map(|y| (u.clone(), y)).collect::<Vec<_>>())
            })),
            fill: Arc::clone(&self.fill),
        }
    }

    #[must_use]
    pub fn filter<F>(&self, f: F) -> Self
    where
        F: Fn(&X) -> bool + Send + Sync + 'static,
    {
        Self {
            inner: self.inner.with_step(Step::filter(move |(_, x): &(U, X)| f(x))),
            fill: Arc::clone(&self.fill),
        }
    }

    /// Nest a further key derived from each value.
    #[must_use]
    pub fn aggregate_by<V, F>(&self, f: F) -> MapAggregator<R, CombinedIndex<U, V>, X>
    where
        V: Key,
        F: Fn(&X) -> V + Send + Sync + 'static,
    {
        self.aggregate_by_with_zerofill(f, Vec::new())
    }

    #[must_use]
    pub fn aggregate_by_with_zerofill<V, F>(
        &self,
        f: F,
        zerofill: impl IntoIterator<Item = V>,
    ) -> MapAggregator<R, CombinedIndex<U, V>, X>
    where
        V: Key,
        F: Fn(&X) -> V + Send + Sync + 'static,
    {
        let keyed = self.inner.with_step(Step::map(move |(u, x): (U, X)| {
            let v = f(&x);
            Ok((CombinedIndex::new(u, v), x))
        }));
        MapAggregator {
            inner: keyed,
            fill: nested_fill(Arc::clone(&self.fill), level_fill(zerofill)),
        }
    }

    /// Nest the query instant as a further key.
    pub fn aggregate_by_timestamp(&self) -> Result<MapAggregator<R, CombinedIndex<U, TimestampMs>, X>> {
        self.inner.require_ungrouped("aggregate_by_timestamp")?;
        let timestamps = self.inner.required_timestamps()?;
        let instants = R::zerofill_timestamps(&timestamps);
        let keyed = self.inner.with_step(Step::root_map(move |root: &R, (u, x): (U, X)| {
            Ok((CombinedIndex::new(u, root.timestamp_key(&timestamps)?), x))
        }));
        Ok(MapAggregator {
            inner: keyed,
            fill: nested_fill(Arc::clone(&self.fill), level_fill(instants)),
        })
    }

    /// Per-key fold with a reduce triple.
    pub fn reduce<S, I, A, C>(&self, identity: I, accumulator: A, combiner: C) -> Result<BTreeMap<U, S>>
    where
        S: Data,
        I: Fn() -> S + Send + Sync + 'static,
        A: Fn(S, X) -> S + Send + Sync + 'static,
        C: Fn(S, S) -> S + Send + Sync + 'static,
    {
        let identity = Arc::new(identity);
        let seed = Arc::clone(&identity);
        let mut result = self.inner.reduce(
            BTreeMap::<U, S>::new,
            move |mut acc, (u, x)| {
                let state = acc.remove(&u).unwrap_or_else(|| seed());
                acc.insert(u, accumulator(state, x));
                acc
            },
            move |mut a, b| {
                for (u, s) in b {
                    let merged = match a.remove(&u) {
                        Some(existing) => combiner(existing, s),
                        None => s,
                    };
                    a.insert(u, merged);
                }
                a
            },
        )?;
        for key in self.filled_keys(result.keys().cloned()) {
            result.entry(key).or_insert_with(|| identity());
        }
        Ok(result)
    }

    /// Per-key fold with a [`CombineFn`].
    pub fn combine<C, A, O>(&self, combiner: C) -> Result<BTreeMap<U, O>>
    where
        C: CombineFn<X, A, O>,
        A: Data,
    {
        let c = Arc::new(combiner);
        let (add, merge) = (Arc::clone(&c), Arc::clone(&c));
        let accs = self.inner.reduce(
            BTreeMap::<U, A>::new,
            move |mut acc, (u, x)| {
                let slot = acc.entry(u).or_insert_with(|| add.create());
                add.add_input(slot, x);
                acc
            },
            move |mut a, b| {
                for (u, s) in b {
                    match a.entry(u) {
                        Entry::Occupied(mut o) => merge.merge(o.get_mut(), s),
                        Entry::Vacant(v) => {
                            v.insert(s);
                        }
                    }
                }
                a
            },
        )?;
        let mut result: BTreeMap<U, O> = accs.into_iter().map(|(u, a)| (u, c.finish(a))).collect();
        for key in self.filled_keys(result.keys().cloned()) {
            result.entry(key).or_insert_with(|| c.finish(c.create()));
        }
        Ok(result)
    }

    pub fn count(&self) -> Result<BTreeMap<U, u64>> {
        self.combine(Count)
    }

    pub fn collect(&self) -> Result<BTreeMap<U, Vec<X>>> {
        self.combine(Collect::new())
    }

    pub fn uniq(&self) -> Result<BTreeMap<U, HashSet<X>>>
    where
        X: Eq + Hash,
    {
        self.combine(DistinctSet::new())
    }

    pub fn count_uniq(&self) -> Result<BTreeMap<U, u64>>
    where
        X: Eq + Hash,
    {
        self.combine(DistinctCount::new())
    }

    pub fn sum(&self) -> Result<BTreeMap<U, X>>
    where
        X: Add<Output = X> + Default,
    {
        self.combine(Sum::new())
    }

    pub fn average(&self) -> Result<BTreeMap<U, f64>>
    where
        X: Into<f64>,
    {
        self.combine(AverageF64)
    }

    pub fn estimated_median(&self) -> Result<BTreeMap<U, f64>>
    where
        X: Into<f64>,
    {
        self.combine(ApproxMedian::default())
    }

    pub fn estimated_quantiles(&self, qs: &[f64]) -> Result<BTreeMap<U, Vec<f64>>>
    where
        X: Into<f64>,
    {
        self.combine(ApproxQuantiles::new(qs.to_vec()))
    }

    /// Pull `(key, value)` pairs one by one.
    pub fn stream(&self) -> Result<ResultStream<(U, X)>> {
        self.inner.stream()
    }
}

impl<R: View, U: Key> MapAggregator<R, U, WeightedValue> {
    pub fn weighted_average(&self) -> Result<BTreeMap<U, f64>> {
        self.combine(WeightedAverage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nest_splits_combined_keys() {
        let mut flat = BTreeMap::new();
        flat.insert(CombinedIndex::new("a", 1), 10);
        flat.insert(CombinedIndex::new("a", 2), 20);
        flat.insert(CombinedIndex::new("b", 1), 30);
        let nested = CombinedIndex::nest(flat);
        assert_eq!(nested.len(), 2);
        assert_eq!(nested["a"][&2], 20);
        assert_eq!(nested["b"].len(), 1);
    }

    #[test]
    fn cartesian_product_covers_every_pair() {
        let keys = cartesian(&BTreeSet::from([1, 2]), &BTreeSet::from(["x", "y", "z"]));
        assert_eq!(keys.len(), 6);
        assert_eq!(keys.first(), Some(&CombinedIndex::new(1, "x")));
        assert_eq!(keys.last(), Some(&CombinedIndex::new(2, "z")));
    }

    #[test]
    fn nested_fill_uses_observed_keys_per_level() {
        let fill = nested_fill(level_fill(Vec::<&str>::new()), level_fill([100, 200, 300]));
        let observed = BTreeSet::from([CombinedIndex::new("way", 200), CombinedIndex::new("node", 100)]);
        let keys = fill(&observed);
        assert_eq!(keys.len(), 6);
        assert!(keys.contains(&CombinedIndex::new("way", 100)));
        assert!(keys.contains(&CombinedIndex::new("node", 300)));

        let outer = nested_fill(fill, level_fill(["a"]));
        assert_eq!(outer(&BTreeSet::new()).len(), 0);
    }
}
