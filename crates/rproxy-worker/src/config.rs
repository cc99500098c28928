//! Worker configuration.

use std::time::Duration;

use rproxy_core::config::{ReconnectSettings, WorkerSettings};

/// Configuration for the worker's control connection and dials.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Reflector control API URL (e.g., "http://reflector.example:7779").
    pub control_url: String,

    /// Reflector worker-data listener, `host:port`.
    pub reflector_data_addr: String,

    /// Local backend every tunnel leads to, `host:port`.
    pub backend_addr: String,

    /// Capacity of the report queue.
    pub report_queue_depth: usize,

    /// Upper bound for each of the two dials per create-request.
    pub dial_timeout: Duration,

    /// Reconnection policy.
    pub reconnect: ReconnectPolicy,
}

impl WorkerConfig {
    /// Create a config for the given endpoints with default tunables.
    pub fn new(control_url: String, reflector_data_addr: String, backend_addr: String) -> Self {
        Self {
            control_url,
            reflector_data_addr,
            backend_addr,
            ..Self::from(&WorkerSettings::default())
        }
    }
}

impl From<&WorkerSettings> for WorkerConfig {
    fn from(settings: &WorkerSettings) -> Self {
        Self {
            control_url: settings.control_url.clone(),
            reflector_data_addr: settings.reflector_data_addr.clone(),
            backend_addr: settings.backend_addr.clone(),
            report_queue_depth: settings.report_queue_depth.max(1),
            dial_timeout: Duration::from_secs(settings.dial_timeout_secs),
            reconnect: ReconnectPolicy::from(&settings.reconnect),
        }
    }
}

/// Exponential backoff reconnection policy.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Initial delay before first reconnect attempt.
    pub initial_delay: Duration,
    /// Maximum delay between reconnect attempts.
    pub max_delay: Duration,
    /// Multiplier applied to delay after each failed attempt.
    pub multiplier: f64,
    /// Maximum number of reconnect attempts (None = unlimited).
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&ReconnectSettings::default())
    }
}

impl From<&ReconnectSettings> for ReconnectPolicy {
    fn from(settings: &ReconnectSettings) -> Self {
        Self {
            initial_delay: Duration::from_millis(settings.initial_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            multiplier: settings.multiplier,
            max_attempts: settings.max_attempts,
        }
    }
}

impl ReconnectPolicy {
    /// Calculate the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let factor = self.multiplier.max(1.0).powi(exponent);
        let cap = self.max_delay.as_secs_f64();
        let delay = self.initial_delay.as_secs_f64() * factor;
        if delay.is_finite() && delay < cap {
            Duration::from_secs_f64(delay)
        } else {
            self.max_delay
        }
    }

    /// Whether another attempt should be made.
    pub fn should_retry(&self, attempt: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempt < max)
    }
}
