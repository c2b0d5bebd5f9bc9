mod common;

use common::*;
use histbeam::memory::{HistoryBuilder, MemoryCellStore};
use histbeam::{
    Contribution, ContributionType, ContributionView, Error, OsmType, TimestampMs, Timestamps,
    View,
};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Two instants bound exactly one edit, but it is the creation at the lower
/// bound rather than the modification at 200. Contributions cover
/// `[first, last)`, and an edit at the last instant would have no bucket to
/// floor into, since floor matching rejects `t >= last`.
#[test]
fn interval_endpoints_bound_exactly_one_edit() -> anyhow::Result<()> {
    let mut store = MemoryCellStore::default();
    store.insert(
        HistoryBuilder::node(1)
            .point(100, &[("amenity", "cafe")], (8.68, 49.41))
            .point(200, &[("amenity", "restaurant")], (8.68, 49.41))
            .build(),
    );
    let query = ContributionView::on(sequential(Arc::new(store)))
        .timestamps(Timestamps::new([100, 200])?);
    assert_eq!(query.count()?, 1);
    let only = query.collect()?;
    assert!(only[0].is(ContributionType::Creation));
    assert_eq!(only[0].next_timestamp(), 200);
    Ok(())
}

#[test]
fn edits_are_classified() -> anyhow::Result<()> {
    let backend = sequential(Arc::new(town()));
    let by_kind = ContributionView::on(backend)
        .timestamps(Timestamps::new([100, 500])?)
        .aggregate_by(|c: &Contribution| c.activities().iter().collect::<Vec<_>>())
        .count()?;
    let expected: BTreeMap<Vec<ContributionType>, u64> = [
        (vec![ContributionType::Creation], 5),
        (vec![ContributionType::Deletion], 1),
        (vec![ContributionType::TagChange], 1),
        (vec![ContributionType::GeometryChange], 1),
    ]
    .into_iter()
    .collect();
    assert_eq!(by_kind, expected);
    Ok(())
}

#[test]
fn edits_are_bucketed_below_the_last_instant() -> anyhow::Result<()> {
    let backend = sequential(Arc::new(town()));
    let counts = ContributionView::on(backend)
        .timestamps(every_hundred())
        .aggregate_by_timestamp()?
        .count()?;
    let expected: BTreeMap<TimestampMs, u64> =
        [(100, 3), (200, 2), (300, 2), (400, 1)].into_iter().collect();
    assert_eq!(counts, expected);
    Ok(())
}

#[test]
fn deletions_keep_the_previous_state() -> anyhow::Result<()> {
    let backend = sequential(Arc::new(town()));
    let bench = ContributionView::on(backend)
        .timestamps(every_hundred())
        .osm_tag_value("amenity", "bench")
        .collect()?;
    assert_eq!(bench.len(), 2);
    let deletion = &bench[1];
    assert!(deletion.is(ContributionType::Deletion));
    assert!(deletion.after().is_none());
    assert_eq!(
        deletion.entity_before().map(|e| e.version),
        Some(1),
        "the deleted state is the one before the edit"
    );
    assert_eq!(bench[0].next_timestamp(), 350);
    assert_eq!(deletion.next_timestamp(), 500);
    Ok(())
}

#[test]
fn filters_see_either_side_of_an_edit() -> anyhow::Result<()> {
    let backend = sequential(Arc::new(town()));
    let mut buildings = ContributionView::on(backend)
        .timestamps(every_hundred())
        .filter_str("building=*")?
        .map(|c: &Contribution| c.entity_key())
        .collect()?;
    buildings.sort_unstable();
    assert_eq!(
        buildings,
        vec![(OsmType::Way, 10), (OsmType::Way, 10), (OsmType::Way, 12)]
    );
    Ok(())
}

#[test]
fn distinct_entities_and_changesets() -> anyhow::Result<()> {
    let mut store = MemoryCellStore::default();
    store.insert(
        HistoryBuilder::node(1)
            .point(100, &[("amenity", "cafe")], (8.68, 49.41))
            .changeset(77)
            .point(150, &[("amenity", "bar")], (8.68, 49.41))
            .changeset(78)
            .build(),
    );
    store.insert(
        HistoryBuilder::node(2)
            .point(120, &[("amenity", "pub")], (8.69, 49.41))
            .changeset(77)
            .build(),
    );
    let query = ContributionView::on(sequential(Arc::new(store))).timestamps(every_hundred());
    assert_eq!(query.map(|c: &Contribution| c.entity_key()).count_uniq()?, 2);
    assert_eq!(query.map(Contribution::changeset_id).count_uniq()?, 2);
    Ok(())
}

#[test]
fn edits_outside_a_custom_index_fail_the_query() -> anyhow::Result<()> {
    let backend = sequential(Arc::new(town()));
    let result = ContributionView::on(backend)
        .timestamps(every_hundred())
        .aggregate_by_timestamp_with(|_: &Contribution| 999)?
        .count();
    assert!(matches!(
        result,
        Err(Error::TimestampOutOfRange { timestamp: 999, .. })
    ));
    Ok(())
}

#[test]
fn a_single_instant_covers_no_edits() -> anyhow::Result<()> {
    let backend = sequential(Arc::new(town()));
    let counts = ContributionView::on(backend)
        .timestamps(Timestamps::single(300))
        .aggregate_by_timestamp()?
        .count()?;
    let expected: BTreeMap<TimestampMs, u64> = [(300, 0)].into_iter().collect();
    assert_eq!(counts, expected);
    Ok(())
}
