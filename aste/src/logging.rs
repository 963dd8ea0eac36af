//! Developer diagnostics for aste itself.
//!
//! - **Tracing (this module)**: `RUST_LOG`-driven output on stderr. Never
//!   persisted and never part of a build report.
//! - **Run logs (`io/run_log`)**: the verbose and summary logs of a build run.
//!   Always written, unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the stderr subscriber. Defaults to `warn` when `RUST_LOG` is unset.
///
/// ```bash
/// RUST_LOG=aste=debug aste start --config aste.toml --task nightly
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    // A second call keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
