//! Tracing/logging initialization.

use tracing_subscriber::EnvFilter;

/// Initialize process-wide tracing: JSON lines to stdout, filtered through
/// `RUST_LOG` (default `info`).
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_current_span(true)
        .try_init();
}
