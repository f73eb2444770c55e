//! Logging init: a `tracing` fmt subscriber on stderr, filtered by `RUST_LOG`.
//!
//! Records emitted through the `log` facade are forwarded by the subscriber's
//! `tracing-log` bridge.

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,spider_engine=debug";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Installs the global subscriber. Panics if one is already installed.
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(std::io::stderr)
        .init();
}

/// Like [`init_logging`], but returns an error when a subscriber already exists.
pub fn try_init_logging() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))
}
