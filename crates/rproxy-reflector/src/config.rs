//! Runtime configuration for the reflector core.

use std::time::Duration;

use rproxy_core::config::{DEFAULT_QUEUE_DEPTH, ReflectorSettings};

/// Tunables for [`crate::Reflector`]. Listen addresses are not part of it;
/// the binary binds the listeners and hands them over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReflectorConfig {
    /// Capacity of the create-request queue.
    pub queue_depth: usize,
    /// Age after which pending tunnels and data connections are evicted.
    pub pending_ttl: Duration,
    /// How often the sweeper looks for expired entries.
    pub sweep_interval: Duration,
    /// How long a report may wait for its data connection to be accepted.
    /// Zero drops unmatched reports immediately.
    pub report_grace: Duration,
}

impl Default for ReflectorConfig {
    fn default() -> Self {
        Self {
            queue_depth: DEFAULT_QUEUE_DEPTH,
            pending_ttl: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
            report_grace: Duration::from_secs(2),
        }
    }
}

impl From<&ReflectorSettings> for ReflectorConfig {
    fn from(settings: &ReflectorSettings) -> Self {
        Self {
            queue_depth: settings.queue_depth.max(1),
            pending_ttl: Duration::from_secs(settings.pending_ttl_secs),
            sweep_interval: Duration::from_secs(settings.sweep_interval_secs.max(1)),
            report_grace: Duration::from_millis(settings.report_grace_ms),
        }
    }
}
