mod common;

use common::*;
use histbeam::grid::MAX_ZOOM;
use histbeam::memory::{MemoryCellIterator, MemoryCellStore};
use histbeam::{
    CellStore, EngineConfig, LocalParallelBackend, SequentialBackend, SnapshotView, Timestamps,
};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

#[test]
fn reads_config_files() -> anyhow::Result<()> {
    let mut file = tempfile::NamedTempFile::new()?;
    write!(file, r#"{{ "max_zoom": 6, "threads": 3, "timeout_ms": 750, "partitions": 5 }}"#)?;
    let config = EngineConfig::from_json_file(file.path())?;
    assert_eq!(config.max_zoom, 6);
    assert_eq!(config.threads, Some(3));
    assert_eq!(config.timeout(), Some(Duration::from_millis(750)));
    assert_eq!(config.partitions, 5);
    Ok(())
}

#[test]
fn missing_fields_fall_back_to_defaults() -> anyhow::Result<()> {
    let config = EngineConfig::from_json_str(r#"{ "threads": 2 }"#)?;
    let defaults = EngineConfig::default();
    assert_eq!(config.max_zoom, defaults.max_zoom);
    assert_eq!(config.timeout(), None);
    assert_eq!(config.threads, Some(2));
    assert_eq!(EngineConfig::from_json_str("{}")?, defaults);
    Ok(())
}

#[test]
fn bad_configs_are_reported() {
    assert!(EngineConfig::from_json_str("{ max_zoom: 6 ").is_err());
    assert!(EngineConfig::from_json_str(r#"{ "max_zoom": "deep" }"#).is_err());
    let missing = EngineConfig::from_json_file("/nonexistent/histbeam.json").unwrap_err();
    assert!(format!("{missing:#}").contains("reading engine config"));
}

#[test]
fn zoom_levels_beyond_the_grid_are_rejected() -> anyhow::Result<()> {
    assert_eq!(EngineConfig::from_json_str(&format!(r#"{{ "max_zoom": {MAX_ZOOM} }}"#))?.max_zoom, MAX_ZOOM);
    for zoom in [MAX_ZOOM + 1, 64, 200] {
        let err = EngineConfig::from_json_str(&format!(r#"{{ "max_zoom": {zoom} }}"#)).unwrap_err();
        assert!(err.to_string().contains("max_zoom"), "{err}");
    }
    assert_eq!(EngineConfig::default().with_max_zoom(70).max_zoom, MAX_ZOOM);
    Ok(())
}

#[test]
fn builders_override_fields() {
    let config = EngineConfig::default()
        .with_max_zoom(4)
        .with_threads(1)
        .with_timeout(Duration::from_secs(2))
        .with_partitions(0);
    assert_eq!(config.max_zoom, 4);
    assert_eq!(config.threads, Some(1));
    assert_eq!(config.timeout_ms, Some(2000));
    assert_eq!(config.partitions, 1);
}

#[test]
fn shallow_grids_need_a_matching_zoom() -> anyhow::Result<()> {
    let mut shallow = MemoryCellStore::new(5);
    for history in [
        histbeam::memory::HistoryBuilder::node(1).point(100, &[("amenity", "cafe")], (8.05, 49.05)),
        histbeam::memory::HistoryBuilder::node(2).point(100, &[("amenity", "bench")], (-70.5, -33.4)),
    ] {
        shallow.insert(history.build());
    }
    let store: Arc<dyn CellStore> = Arc::new(shallow);
    let config = EngineConfig::default().with_max_zoom(5).with_threads(2);

    let sequential = SequentialBackend::new(Arc::clone(&store), Arc::new(MemoryCellIterator))
        .with_config(config.clone());
    let parallel =
        LocalParallelBackend::new(Arc::clone(&store), Arc::new(MemoryCellIterator)).with_config(config)?;
    for backend in [
        Arc::new(sequential) as Arc<dyn histbeam::Backend>,
        Arc::new(parallel) as Arc<dyn histbeam::Backend>,
    ] {
        let count = SnapshotView::on(backend)
            .timestamps(Timestamps::single(200))
            .count()?;
        assert_eq!(count, 2);
    }
    Ok(())
}

#[test]
fn logging_can_be_initialized_twice() -> anyhow::Result<()> {
    histbeam::logging::init();
    histbeam::logging::init();
    let count = SnapshotView::on(sequential(Arc::new(town())))
        .timestamps(every_hundred())
        .count()?;
    assert_eq!(count, 17);
    Ok(())
}
