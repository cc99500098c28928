//! Shared tracing/logging initialization.
//!
//! Both binaries install the same subscriber: an env-filter seeded from
//! `--log-level` (overridable through `RUST_LOG`) and either human-readable
//! or JSON output.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Build the filter directive for a crate at the given level, e.g.
/// `rproxy_worker=debug,rproxy_core=debug`.
pub fn default_filter(crate_name: &str, level: &str) -> String {
    format!("{crate_name}={level},rproxy_core={level}")
}

/// Initialise the global tracing subscriber.
///
/// `RUST_LOG` wins over `default_filter` when set. Calling this twice is
/// harmless: the second subscriber is discarded.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let registry = tracing_subscriber::registry().with(env_filter);
    let installed = if log_json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };
    if installed.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}
