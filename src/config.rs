//! Engine configuration shared by all backends.
//!
//! ```
//! use histbeam::EngineConfig;
//!
//! let cfg = EngineConfig::from_json_str(r#"{ "max_zoom": 8, "timeout_ms": 2500 }"#)?;
//! assert_eq!(cfg.max_zoom, 8);
//! assert_eq!(cfg.timeout().map(|t| t.as_millis()), Some(2500));
//! # Ok::<_, anyhow::Error>(())
//! ```

use crate::grid::MAX_ZOOM;
use anyhow::{Context, ensure};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Settings that apply to every query run through a backend.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Deepest grid level whose cells are enumerated for an area of interest,
    /// at most [`MAX_ZOOM`].
    pub max_zoom: u32,
    /// Worker threads for the partition-parallel scan. `None` uses rayon's global pool.
    pub threads: Option<usize>,
    /// Default query deadline in milliseconds, honored only by cancelable backends.
    pub timeout_ms: Option<u64>,
    /// Number of partitions cells are hashed into when building a cluster.
    pub partitions: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_zoom: 12,
            threads: None,
            timeout_ms: None,
            partitions: 2 * num_cpus::get().max(2),
        }
    }
}

impl EngineConfig {
    /// Parse a config from JSON. Missing fields fall back to [`Default`].
    pub fn from_json_str(json: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(json).context("parsing engine config")?;
        ensure!(
            config.max_zoom <= MAX_ZOOM,
            "max_zoom {} exceeds the deepest grid level {MAX_ZOOM}",
            config.max_zoom
        );
        Ok(config)
    }

    /// Read and parse a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading engine config {}", path.display()))?;
        Self::from_json_str(&raw)
    }

    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    #[must_use]
    pub fn with_max_zoom(mut self, max_zoom: u32) -> Self {
        self.max_zoom = max_zoom.min(MAX_ZOOM);
        self
    }

    #[must_use]
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    #[must_use]
    pub fn with_partitions(mut self, partitions: usize) -> Self {
        self.partitions = partitions.max(1);
        self
    }
}
