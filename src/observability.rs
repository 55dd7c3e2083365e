//! Tracing initialization for embedders and tests.

use tracing_subscriber::EnvFilter;

/// Install a global `tracing` subscriber reading `RUST_LOG`, falling back to
/// `default_filter` (e.g. `"ensemble=info"`). Later calls are ignored once a
/// subscriber is installed.
pub fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .is_err()
    {
        // Another subscriber won; keep it.
    }
}
