//! Tracing setup for the configurator binary.
//!
//! Logs go to stderr so stdout carries only run output (step output or the
//! dry-run command previews).

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`. Defaults to `info` if unset, so step starts and skipped
/// roles are visible without extra flags.
///
/// # Example
/// ```bash
/// RUST_LOG=configurator=debug configurator --root ./project run
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
