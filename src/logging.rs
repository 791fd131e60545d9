//! Logging setup for the `tally` binary.
//!
//! One compact, human-readable layer on stderr. `RUST_LOG` takes precedence
//! over the `--log-level` flag when set.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber.
///
/// Returns `false` if a subscriber was already installed.
pub fn init_logging(default_level: &str) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_thread_names(true)
                .compact(),
        )
        .try_init()
        .is_ok()
}

/// Logging for tests: captured by the test harness, never panics on re-init.
pub fn init_test_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_test_writer()
                .compact(),
        )
        .try_init();
}
