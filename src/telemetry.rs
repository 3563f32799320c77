//! Tracing setup for the `tessera` binary.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Environment variable holding the log filter directives.
pub const LOG_ENV: &str = "TESSERA_LOG";

/// Initialize tracing with the TESSERA_LOG environment variable.
///
/// Defaults to "warn", or "debug" for this crate when `verbose` is set.
/// Logs go to stderr so command output on stdout stays machine-readable.
pub fn init_tracing(verbose: bool) {
    let fallback = if verbose { "warn,tessera=debug" } else { "warn" };

    // A subscriber may already be installed (tests, embedding binaries).
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(fallback)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}
