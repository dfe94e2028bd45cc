//! Subscriber setup for the binary and for embedders.
//!
//! Human-readable events go to stderr so stdout stays clean for the JSON
//! profile. The filter defaults to `info` (`debug` when verbose) and honours
//! `RUST_LOG`.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::log_manager::LogManager;

pub fn default_directive(verbose: bool) -> &'static str {
    if verbose { "debug" } else { "info" }
}

/// Installs the global subscriber and returns the in-memory log it feeds.
///
/// Calling it again after a subscriber is already set leaves the first one in
/// place; the returned manager then stays empty.
pub fn init_logging(verbose: bool) -> LogManager {
    let manager = LogManager::new();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(manager.clone())
        .try_init();

    manager
}
