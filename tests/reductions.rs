mod common;

use common::*;
use histbeam::combiners::{CombineFn, TDigest};
use histbeam::memory::{HistoryBuilder, MemoryCellStore};
use histbeam::{Snapshot, SnapshotView, Timestamps};
use std::sync::Arc;

/// Nodes tagged `height=1..=n`, spread over many cells.
fn heights(n: i64) -> MemoryCellStore {
    let mut store = MemoryCellStore::default();
    for i in 1..=n {
        let height = i.to_string();
        store.insert(
            HistoryBuilder::node(i)
                .point(
                    100,
                    &[("height", height.as_str())],
                    (-179.5 + (i % 300) as f64, -60.0 + (i / 300) as f64),
                )
                .build(),
        );
    }
    store
}

fn height_of(s: &Snapshot) -> f64 {
    s.entity()
        .tag("height")
        .and_then(|h| h.parse().ok())
        .unwrap_or(f64::NAN)
}

#[test]
fn averages_and_sums() -> anyhow::Result<()> {
    let store = Arc::new(heights(100));
    for backend in all_backends(&store) {
        let values = SnapshotView::on(backend)
            .timestamps(Timestamps::single(100))
            .map(height_of);
        assert_eq!(values.sum()?, 5050.0);
        assert!((values.average()? - 50.5).abs() < 1e-12);
    }
    Ok(())
}

#[test]
fn average_of_nothing_is_nan() -> anyhow::Result<()> {
    let average = SnapshotView::on(sequential(Arc::new(town())))
        .timestamps(every_hundred())
        .osm_tag("shop")
        .map(|_: &Snapshot| 1.0)
        .average()?;
    assert!(average.is_nan());
    Ok(())
}

#[test]
fn estimated_quantiles_are_close() -> anyhow::Result<()> {
    let store = Arc::new(heights(1000));
    for backend in all_backends(&store) {
        let values = SnapshotView::on(backend)
            .timestamps(Timestamps::single(100))
            .map(height_of);
        let median = values.estimated_median()?;
        assert!((median - 500.5).abs() < 10.0, "median {median}");
        let q = values.estimated_quantiles(&[0.0, 0.9, 1.0])?;
        assert_eq!(q[0], 1.0);
        assert!((q[1] - 900.0).abs() < 15.0, "p90 {}", q[1]);
        assert_eq!(q[2], 1000.0);
        let p10 = values.estimated_quantile(0.1)?;
        assert!((p10 - 100.0).abs() < 15.0, "p10 {p10}");
    }
    Ok(())
}

#[test]
fn distinct_values() -> anyhow::Result<()> {
    let query = SnapshotView::on(sequential(Arc::new(town()))).timestamps(every_hundred());
    let amenities = query
        .osm_tag("amenity")
        .map(|s: &Snapshot| s.entity().tag("amenity").unwrap_or_default().to_string())
        .uniq()?;
    let mut amenities: Vec<String> = amenities.into_iter().collect();
    amenities.sort();
    assert_eq!(amenities, vec!["bench".to_string(), "cafe".to_string()]);
    assert_eq!(query.map(|s: &Snapshot| s.entity().id).count_uniq()?, 5);
    Ok(())
}

/// Longest entity name seen.
struct Longest;

impl CombineFn<String, Option<String>, Option<String>> for Longest {
    fn create(&self) -> Option<String> {
        None
    }

    fn add_input(&self, acc: &mut Option<String>, value: String) {
        if acc.as_ref().is_none_or(|a| value.len() > a.len()) {
            *acc = Some(value);
        }
    }

    fn merge(&self, acc: &mut Option<String>, other: Option<String>) {
        if let Some(value) = other {
            self.add_input(acc, value);
        }
    }

    fn finish(&self, acc: Option<String>) -> Option<String> {
        acc
    }
}

#[test]
fn custom_combiners() -> anyhow::Result<()> {
    let store = Arc::new(town());
    for backend in all_backends(&store) {
        let longest = SnapshotView::on(backend)
            .timestamps(every_hundred())
            .map(|s: &Snapshot| {
                s.entity()
                    .tags
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect::<Vec<_>>()
                    .join(";")
            })
            .combine(Longest)?;
        assert_eq!(longest.as_deref(), Some("amenity=cafe;name=Alte Bruecke"));
    }
    Ok(())
}

#[test]
fn digests_merge_like_one() {
    let mut left = TDigest::default();
    let mut right = TDigest::default();
    let mut whole = TDigest::default();
    for i in 0..5000 {
        let v = f64::from(i);
        whole.add(v);
        if i % 2 == 0 {
            left.add(v);
        } else {
            right.add(v);
        }
    }
    left.merge(&right);
    assert_eq!(left.count(), whole.count());
    for q in [0.25, 0.5, 0.75] {
        assert!((left.quantile(q) - whole.quantile(q)).abs() < 50.0, "q={q}");
    }
}
