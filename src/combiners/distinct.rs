//! Exact distinct-value combiners.

use super::CombineFn;
use std::collections::HashSet;
use std::hash::Hash;
use std::marker::PhantomData;

fn union_into<T: Eq + Hash>(acc: &mut HashSet<T>, mut other: HashSet<T>) {
    if acc.len() < other.len() {
        std::mem::swap(acc, &mut other);
    }
    acc.extend(other);
}

/// The set of distinct values.
#[derive(Clone, Copy, Debug, Default)]
pub struct DistinctSet<T>(pub PhantomData<fn() -> T>);

impl<T> DistinctSet<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> CombineFn<T, HashSet<T>, HashSet<T>> for DistinctSet<T>
where
    T: Eq + Hash + Send + 'static,
{
    fn create(&self) -> HashSet<T> {
        HashSet::new()
    }

    fn add_input(&self, acc: &mut HashSet<T>, v: T) {
        acc.insert(v);
    }

    fn merge(&self, acc: &mut HashSet<T>, other: HashSet<T>) {
        union_into(acc, other);
    }

    fn finish(&self, acc: HashSet<T>) -> HashSet<T> {
        acc
    }
}

/// Number of distinct values.
#[derive(Clone, Copy, Debug, Default)]
pub struct DistinctCount<T>(pub PhantomData<fn() -> T>);

impl<T> DistinctCount<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> CombineFn<T, HashSet<T>, u64> for DistinctCount<T>
where
    T: Eq + Hash + Send + 'static,
{
    fn create(&self) -> HashSet<T> {
        HashSet::new()
    }

    fn add_input(&self, acc: &mut HashSet<T>, v: T) {
        acc.insert(v);
    }

    fn merge(&self, acc: &mut HashSet<T>, other: HashSet<T>) {
        union_into(acc, other);
    }

    fn finish(&self, acc: HashSet<T>) -> u64 {
        acc.len() as u64
    }
}
