//! Logging bootstrap.
//!
//! The library itself only emits `tracing` events; this helper is for
//! binaries (and tests) that want a sensible subscriber without wiring one
//! up themselves. `RUST_LOG` overrides the default filter.

use tracing_subscriber::EnvFilter;

/// Install a stderr `tracing` subscriber with the given default filter
/// (e.g. `"info"` or `"filedist=debug"`).
///
/// Safe to call more than once; later calls are no-ops.
pub fn init(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
