//! Subscriber setup for the binaries. The library itself only emits
//! `tracing` events and never installs a subscriber.

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "cadlink=info";

/// Log to stderr, filtered by `RUST_LOG` (default `cadlink=info`).
///
/// Safe to call more than once; later calls are ignored.
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into()),
        )
        .try_init();
}
