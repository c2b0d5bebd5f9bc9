//! Mean-style combiners: `AverageF64` and `WeightedAverage`.

use super::CombineFn;
use serde::{Deserialize, Serialize};

/// Arithmetic mean as `f64`.
///
/// An empty input yields `NaN`: there is no mean of nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct AverageF64;

impl<V> CombineFn<V, (f64, u64), f64> for AverageF64
where
    V: Into<f64>,
{
    fn create(&self) -> (f64, u64) {
        (0.0, 0)
    }

    fn add_input(&self, acc: &mut (f64, u64), v: V) {
        acc.0 += v.into();
        acc.1 += 1;
    }

    fn merge(&self, acc: &mut (f64, u64), other: (f64, u64)) {
        acc.0 += other.0;
        acc.1 += other.1;
    }

    #[allow(clippy::cast_precision_loss)]
    fn finish(&self, acc: (f64, u64)) -> f64 {
        if acc.1 == 0 {
            f64::NAN
        } else {
            acc.0 / acc.1 as f64
        }
    }
}

/// A value paired with its weight, the input of [`WeightedAverage`].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct WeightedValue {
    pub value: f64,
    pub weight: f64,
}

impl WeightedValue {
    #[must_use]
    pub const fn new(value: f64, weight: f64) -> Self {
        Self { value, weight }
    }
}

/// `sum(value * weight) / sum(weight)`; `NaN` when the total weight is zero.
#[derive(Clone, Copy, Debug, Default)]
pub struct WeightedAverage;

impl CombineFn<WeightedValue, (f64, f64), f64> for WeightedAverage {
    fn create(&self) -> (f64, f64) {
        (0.0, 0.0)
    }

    fn add_input(&self, acc: &mut (f64, f64), v: WeightedValue) {
        acc.0 = v.value.mul_add(v.weight, acc.0);
        acc.1 += v.weight;
    }

    fn merge(&self, acc: &mut (f64, f64), other: (f64, f64)) {
        acc.0 += other.0;
        acc.1 += other.1;
    }

    fn finish(&self, acc: (f64, f64)) -> f64 {
        if acc.1 == 0.0 {
            f64::NAN
        } else {
            acc.0 / acc.1
        }
    }
}
