//! Approximate quantiles with a merging t-digest.
//!
//! Values are buffered and folded into a bounded list of centroids whenever the
//! buffer fills. Centroid sizes follow the arcsine scale function, which keeps
//! clusters small near the tails and lets them grow around the median, so the
//! extreme quantiles stay precise. Two digests merge by pooling their centroids
//! and re-running the same pass, which makes the digest usable as a reduce
//! accumulator across cells and nodes.

use super::CombineFn;
use std::f64::consts::PI;
use std::marker::PhantomData;

#[derive(Clone, Copy, Debug, PartialEq)]
struct Centroid {
    mean: f64,
    weight: f64,
}

/// Mergeable quantile sketch.
#[derive(Clone, Debug)]
pub struct TDigest {
    compression: f64,
    centroids: Vec<Centroid>,
    buffer: Vec<f64>,
    count: f64,
    min: f64,
    max: f64,
}

impl Default for TDigest {
    fn default() -> Self {
        Self::new(100.0)
    }
}

impl TDigest {
    /// `compression` bounds the number of centroids (roughly `compression / 2`).
    #[must_use]
    pub fn new(compression: f64) -> Self {
        Self {
            compression: compression.max(10.0),
            centroids: Vec::new(),
            buffer: Vec::new(),
            count: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    /// Add one observation. Non-finite values are ignored.
    pub fn add(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.count += 1.0;
        self.buffer.push(value);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let capacity = (self.compression * 4.0) as usize;
        if self.buffer.len() >= capacity {
            self.flush();
        }
    }

    pub fn merge(&mut self, other: &Self) {
        if other.is_empty() {
            return;
        }
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.count += other.count;
        self.buffer.extend_from_slice(&other.buffer);
        self.centroids.extend_from_slice(&other.centroids);
        self.flush();
    }

    #[must_use]
    pub fn count(&self) -> f64 {
        self.count
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0.0
    }

    /// Estimate the value at rank `q` in `[0, 1]`; `NaN` when empty.
    ///
    /// ```
    /// use histbeam::combiners::TDigest;
    /// let mut digest = TDigest::new(100.0);
    /// (1..=1000).for_each(|i| digest.add(f64::from(i)));
    /// assert!((digest.quantile(0.5) - 500.0).abs() < 10.0);
    /// assert_eq!(digest.quantile(1.0), 1000.0);
    /// ```
    #[must_use]
    pub fn quantile(&self, q: f64) -> f64 {
        if self.is_empty() {
            return f64::NAN;
        }
        if !self.buffer.is_empty() {
            let mut flushed = self.clone();
            flushed.flush();
            return flushed.quantile(q);
        }
        let q = q.clamp(0.0, 1.0);
        if q == 0.0 {
            return self.min;
        }
        if q == 1.0 {
            return self.max;
        }
        let cs = &self.centroids;
        if cs.len() == 1 {
            return cs[0].mean;
        }

        let target = q * self.count;
        let first = cs[0];
        if target < first.weight / 2.0 {
            return lerp(self.min, first.mean, target / (first.weight / 2.0));
        }

        let mut seen = 0.0;
        for pair in cs.windows(2) {
            let (left, right) = (pair[0], pair[1]);
            let left_center = seen + left.weight / 2.0;
            let right_center = seen + left.weight + right.weight / 2.0;
            if target <= right_center {
                let t = (target - left_center) / (right_center - left_center);
                return lerp(left.mean, right.mean, t);
            }
            seen += left.weight;
        }

        let last = cs[cs.len() - 1];
        let last_center = self.count - last.weight / 2.0;
        lerp(last.mean, self.max, (target - last_center) / (last.weight / 2.0))
    }

    #[must_use]
    pub fn quantiles(&self, qs: &[f64]) -> Vec<f64> {
        if self.buffer.is_empty() {
            return qs.iter().map(|&q| self.quantile(q)).collect();
        }
        let mut flushed = self.clone();
        flushed.flush();
        flushed.quantiles(qs)
    }

    /// Scale function: the k-index of rank `q`.
    fn k(&self, q: f64) -> f64 {
        self.compression / (2.0 * PI) * (2.0 * q - 1.0).clamp(-1.0, 1.0).asin()
    }

    fn flush(&mut self) {
        if self.buffer.is_empty() && self.centroids.len() <= 1 {
            return;
        }
        let mut pending: Vec<Centroid> = std::mem::take(&mut self.centroids);
        pending.extend(self.buffer.drain(..).map(|mean| Centroid { mean, weight: 1.0 }));
        pending.sort_by(|a, b| a.mean.total_cmp(&b.mean));

        let total = self.count;
        let mut merged: Vec<Centroid> = Vec::with_capacity(pending.len().min(1024));
        let mut seen = 0.0;
        let mut current = pending[0];
        let mut k_low = self.k(0.0);
        for next in pending.into_iter().skip(1) {
            let q_high = (seen + current.weight + next.weight) / total;
            if self.k(q_high) - k_low <= 1.0 {
                let weight = current.weight + next.weight;
                current.mean += (next.mean - current.mean) * next.weight / weight;
                current.weight = weight;
            } else {
                seen += current.weight;
                k_low = self.k(seen / total);
                merged.push(current);
                current = next;
            }
        }
        merged.push(current);
        self.centroids = merged;
    }
}

fn lerp(a: f64, b: f64, t: f64) -> f64 {
    (b - a).mul_add(t.clamp(0.0, 1.0), a)
}

/// Estimated quantiles at fixed ranks.
#[derive(Clone, Debug)]
pub struct ApproxQuantiles<V> {
    ranks: Vec<f64>,
    compression: f64,
    _value: PhantomData<fn() -> V>,
}

impl<V> ApproxQuantiles<V> {
    #[must_use]
    pub fn new(ranks: Vec<f64>) -> Self {
        Self::with_compression(ranks, 100.0)
    }

    #[must_use]
    pub const fn with_compression(ranks: Vec<f64>, compression: f64) -> Self {
        Self {
            ranks,
            compression,
            _value: PhantomData,
        }
    }
}

impl<V> CombineFn<V, TDigest, Vec<f64>> for ApproxQuantiles<V>
where
    V: Into<f64> + 'static,
{
    fn create(&self) -> TDigest {
        TDigest::new(self.compression)
    }

    fn add_input(&self, acc: &mut TDigest, v: V) {
        acc.add(v.into());
    }

    fn merge(&self, acc: &mut TDigest, other: TDigest) {
        acc.merge(&other);
    }

    fn finish(&self, acc: TDigest) -> Vec<f64> {
        acc.quantiles(&self.ranks)
    }
}

/// Estimated median.
#[derive(Clone, Debug)]
pub struct ApproxMedian<V> {
    compression: f64,
    _value: PhantomData<fn() -> V>,
}

impl<V> Default for ApproxMedian<V> {
    fn default() -> Self {
        Self {
            compression: 100.0,
            _value: PhantomData,
        }
    }
}

impl<V> CombineFn<V, TDigest, f64> for ApproxMedian<V>
where
    V: Into<f64> + 'static,
{
    fn create(&self) -> TDigest {
        TDigest::new(self.compression)
    }

    fn add_input(&self, acc: &mut TDigest, v: V) {
        acc.add(v.into());
    }

    fn merge(&self, acc: &mut TDigest, other: TDigest) {
        acc.merge(&other);
    }

    fn finish(&self, acc: TDigest) -> f64 {
        acc.quantile(0.5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merged_digests_track_uniform_distribution() {
        let mut a = TDigest::new(100.0);
        let mut b = TDigest::new(100.0);
        for i in 0..5_000 {
            let v = f64::from(i);
            if i % 2 == 0 { a.add(v) } else { b.add(v) }
        }
        a.merge(&b);
        assert_eq!(a.count(), 5_000.0);
        for (q, expected) in [(0.1, 500.0), (0.5, 2_500.0), (0.9, 4_500.0)] {
            let got = a.quantile(q);
            assert!((got - expected).abs() < 50.0, "q={q}: {got}");
        }
        assert_eq!(a.quantile(0.0), 0.0);
        assert_eq!(a.quantile(1.0), 4_999.0);
    }

    #[test]
    fn empty_digest_is_nan() {
        assert!(TDigest::default().quantile(0.5).is_nan());
        let mut d = TDigest::default();
        d.merge(&TDigest::default());
        assert!(d.is_empty());
    }

    #[test]
    fn flush_bounds_centroid_count() {
        let mut d = TDigest::new(50.0);
        (0..20_000).for_each(|i| d.add(f64::from(i % 977)));
        d.flush();
        assert!(d.centroids.len() < 100, "{} centroids", d.centroids.len());
    }
}
