mod common;

use common::*;
use geo::{Area, BoundingRect, MultiPolygon};
use histbeam::combiners::WeightedValue;
use histbeam::memory::{HistoryBuilder, MemoryCellStore};
use histbeam::{
    CombinedIndex, Contribution, ContributionView, OsmType, Snapshot, SnapshotView, Timestamps,
};
use std::collections::BTreeMap;
use std::sync::Arc;

fn regions() -> Vec<(&'static str, MultiPolygon<f64>)> {
    vec![
        ("west", square(7.5, 48.5, 2.0)),
        ("east", square(9.5, 48.5, 3.0)),
        ("north", square(0.0, 60.0, 1.0)),
    ]
}

#[test]
fn custom_keys_with_zerofill() -> anyhow::Result<()> {
    let backend = sequential(Arc::new(town()));
    let amenities = SnapshotView::on(backend)
        .timestamps(Timestamps::single(300))
        .osm_tag("amenity")
        .aggregate_by_with_zerofill(
            |s: &Snapshot| s.entity().tag("amenity").unwrap_or_default().to_string(),
            ["bench", "cafe", "toilets"].map(String::from),
        )
        .count()?;
    let expected: BTreeMap<String, u64> = [("bench", 1), ("cafe", 1), ("toilets", 0)]
        .into_iter()
        .map(|(k, n)| (k.to_string(), n))
        .collect();
    assert_eq!(amenities, expected);
    Ok(())
}

#[test]
fn nested_keys_fill_every_observed_combination() -> anyhow::Result<()> {
    let backend = sequential(Arc::new(town()));
    let query = SnapshotView::on(backend).timestamps(every_hundred());

    let flat = query
        .aggregate_by_timestamp()?
        .aggregate_by(|s: &Snapshot| s.entity().osm_type)
        .count()?;
    assert_eq!(flat.len(), 10);
    let nested = CombinedIndex::nest(flat);
    assert_eq!(nested.len(), 5);
    assert_eq!(nested[&100][&OsmType::Node], 1);
    assert_eq!(nested[&100][&OsmType::Way], 0);
    assert_eq!(nested[&200][&OsmType::Way], 2);
    assert_eq!(nested[&400][&OsmType::Way], 3);

    let by_type = CombinedIndex::nest(
        query
            .aggregate_by(|s: &Snapshot| s.entity().osm_type)
            .aggregate_by_timestamp()?
            .count()?,
    );
    let ways: BTreeMap<i64, u64> = [(100, 0), (200, 2), (300, 2), (400, 3), (500, 3)]
        .into_iter()
        .collect();
    assert_eq!(by_type[&OsmType::Way], ways);
    assert_eq!(by_type[&OsmType::Node].len(), 5);
    Ok(())
}

#[test]
fn regions_are_zero_filled() -> anyhow::Result<()> {
    let backend = sequential(Arc::new(town()));
    let counts = SnapshotView::on(backend)
        .timestamps(Timestamps::single(500))
        .aggregate_by_geometry(regions())?
        .count()?;
    let expected: BTreeMap<&str, u64> = [("east", 3), ("north", 0), ("west", 1)]
        .into_iter()
        .collect();
    assert_eq!(counts, expected);
    Ok(())
}

#[test]
fn regions_and_instants_combine() -> anyhow::Result<()> {
    let backend = sequential(Arc::new(town()));
    let query = SnapshotView::on(backend).timestamps(every_hundred());

    let region_first = query
        .aggregate_by_geometry(regions())?
        .aggregate_by_timestamp()?
        .count()?;
    assert_eq!(region_first.len(), 15);
    assert_eq!(region_first[&CombinedIndex::new("west", 100)], 1);
    assert_eq!(region_first[&CombinedIndex::new("east", 200)], 2);
    assert_eq!(region_first[&CombinedIndex::new("north", 300)], 0);

    let instant_first = query
        .aggregate_by_timestamp()?
        .aggregate_by_geometry(regions())?
        .count()?;
    assert_eq!(instant_first.len(), 15);
    for (key, n) in &region_first {
        let swapped = CombinedIndex::new(key.second, key.first);
        assert_eq!(instant_first[&swapped], *n, "{key:?}");
    }
    Ok(())
}

#[test]
fn areas_crossing_regions_are_clipped() -> anyhow::Result<()> {
    let mut store = MemoryCellStore::default();
    store.insert(
        HistoryBuilder::way(1)
            .line(100, &[("building", "yes")], &ring(1.9, 0.9, 0.2))
            .build(),
    );
    let tiles = vec![("a", square(0.0, 0.0, 2.0)), ("b", square(2.0, 0.0, 2.0))];
    let areas = SnapshotView::on(sequential(Arc::new(store)))
        .timestamps(Timestamps::single(200))
        .aggregate_by_geometry(tiles)?
        .map(|s: &Snapshot| s.geometry().unsigned_area())
        .sum()?;
    assert_eq!(areas.len(), 2);
    for (tile, area) in &areas {
        assert!((area - 0.02).abs() < 1e-9, "{tile}: {area}");
    }
    Ok(())
}

#[test]
fn edits_are_split_by_region() -> anyhow::Result<()> {
    let backend = sequential(Arc::new(town()));
    let counts = ContributionView::on(backend)
        .timestamps(every_hundred())
        .aggregate_by_geometry(regions())?
        .count()?;
    let expected: BTreeMap<&str, u64> = [("east", 4), ("north", 0), ("west", 4)]
        .into_iter()
        .collect();
    assert_eq!(counts, expected);
    Ok(())
}

#[test]
fn a_move_between_regions_shows_up_in_both() -> anyhow::Result<()> {
    let mut store = MemoryCellStore::default();
    store.insert(
        HistoryBuilder::node(5)
            .point(100, &[("amenity", "food_truck")], (8.0, 49.0))
            .point(200, &[("amenity", "food_truck")], (10.0, 49.0))
            .build(),
    );
    let per_region = ContributionView::on(sequential(Arc::new(store)))
        .timestamps(Timestamps::new([100, 300])?)
        .aggregate_by_geometry(regions())?
        .collect()?;
    assert_eq!(per_region["west"].len(), 2);
    assert_eq!(per_region["east"].len(), 1);
    assert!(per_region["north"].is_empty());

    let arrival: &Contribution = &per_region["east"][0];
    assert_eq!(arrival.timestamp(), 200);
    assert!(arrival.geometry_before().is_some_and(|g| g.bounding_rect().is_none()));
    assert!(arrival.geometry_after().is_some_and(|g| g.bounding_rect().is_some()));
    Ok(())
}

#[test]
fn averages_per_key() -> anyhow::Result<()> {
    let backend = sequential(Arc::new(town()));
    let by_type = SnapshotView::on(backend)
        .timestamps(Timestamps::single(500))
        .aggregate_by(|s: &Snapshot| s.entity().osm_type);

    let versions = by_type
        .map(|s: &Snapshot| f64::from(s.entity().version))
        .average()?;
    assert!((versions[&OsmType::Node] - 2.0).abs() < 1e-12);
    assert!((versions[&OsmType::Way] - 4.0 / 3.0).abs() < 1e-12);

    let weighted = by_type
        .map(|s: &Snapshot| WeightedValue::new(s.entity().id as f64, 1.0))
        .weighted_average()?;
    assert!((weighted[&OsmType::Node] - 1.0).abs() < 1e-12);
    assert!((weighted[&OsmType::Way] - 11.0).abs() < 1e-12);
    Ok(())
}

#[test]
fn keyed_streams_carry_their_keys() -> anyhow::Result<()> {
    let backend = sequential(Arc::new(town()));
    let pairs = SnapshotView::on(backend)
        .timestamps(every_hundred())
        .aggregate_by_timestamp()?
        .stream()?
        .collect::<histbeam::Result<Vec<_>>>()?;
    assert_eq!(pairs.len(), 17);
    assert!(pairs.iter().all(|(t, s)| *t == s.timestamp()));
    Ok(())
}
