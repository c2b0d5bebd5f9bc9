//! Tracing subscriber setup.
//!
//! The engine only emits `tracing` events; installing a subscriber is up to the
//! caller. [`init`] installs a formatted subscriber filtered by `RUST_LOG`
//! (default `histbeam=info`) and is safe to call more than once.

use tracing_subscriber::EnvFilter;

pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("histbeam=info"));
    // try_init fails when a global subscriber already exists, which is fine.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init();
}
