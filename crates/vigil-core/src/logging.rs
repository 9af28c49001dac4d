//! Tracing subscriber bootstrap.

use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber.
///
/// Filter resolution order: `VIGIL_LOG` env var, then `RUST_LOG`, then the
/// provided default directive. Safe to call more than once; subsequent
/// calls are no-ops.
pub fn init(default_directive: &str) {
    let filter = std::env::var("VIGIL_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| default_directive.to_owned());

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&filter))
        .with_target(true)
        .try_init();
    tracing::debug!(%filter, "tracing initialized");
}
