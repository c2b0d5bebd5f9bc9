use super::CombineFn;
use std::marker::PhantomData;

/// Gather every value into a `Vec`.
///
/// Cells are merged as they finish, so the output order is unspecified.
#[derive(Clone, Copy, Debug, Default)]
pub struct Collect<T>(pub PhantomData<fn() -> T>);

impl<T> Collect<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T: Send + 'static> CombineFn<T, Vec<T>, Vec<T>> for Collect<T> {
    fn create(&self) -> Vec<T> {
        Vec::new()
    }

    fn add_input(&self, acc: &mut Vec<T>, v: T) {
        acc.push(v);
    }

    fn merge(&self, acc: &mut Vec<T>, mut other: Vec<T>) {
        if acc.len() < other.len() {
            std::mem::swap(acc, &mut other);
        }
        acc.append(&mut other);
    }

    fn finish(&self, acc: Vec<T>) -> Vec<T> {
        acc
    }
}
