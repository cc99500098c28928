//! Settings resolution for rproxy.
//!
//! Resolution order (lowest to highest priority):
//! 1. Built-in defaults
//! 2. Settings file (`--config <path>`, else the global settings file)
//! 3. Environment variables and CLI flags, applied by each binary

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Client-facing listener port on the reflector.
pub const DEFAULT_CLIENT_PORT: u16 = 7777;
/// Worker data listener port on the reflector.
pub const DEFAULT_WORKER_PORT: u16 = 7778;
/// Control API port on the reflector.
pub const DEFAULT_API_PORT: u16 = 7779;
/// Depth of the create-request queue and of the worker's report queue.
pub const DEFAULT_QUEUE_DEPTH: usize = 128;

/// Complete rproxy settings file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub reflector: ReflectorSettings,
    #[serde(default)]
    pub worker: WorkerSettings,
}

/// Reflector-side settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReflectorSettings {
    pub client_addr: SocketAddr,
    pub worker_addr: SocketAddr,
    pub api_addr: SocketAddr,
    pub queue_depth: usize,
    /// Pending tunnels and data connections older than this are evicted.
    pub pending_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    /// How long a report may wait for its data connection to be accepted.
    pub report_grace_ms: u64,
}

impl Default for ReflectorSettings {
    fn default() -> Self {
        Self {
            client_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_CLIENT_PORT)),
            worker_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_WORKER_PORT)),
            api_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_API_PORT)),
            queue_depth: DEFAULT_QUEUE_DEPTH,
            pending_ttl_secs: 30,
            sweep_interval_secs: 5,
            report_grace_ms: 2000,
        }
    }
}

/// Worker-side settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Reflector control API URL, e.g. `http://reflector.example:7779`.
    pub control_url: String,
    /// Reflector worker data listener, `host:port`.
    pub reflector_data_addr: String,
    /// Local backend the tunnels lead to, `host:port`.
    pub backend_addr: String,
    pub report_queue_depth: usize,
    pub dial_timeout_secs: u64,
    pub reconnect: ReconnectSettings,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            control_url: format!("http://127.0.0.1:{DEFAULT_API_PORT}"),
            reflector_data_addr: format!("127.0.0.1:{DEFAULT_WORKER_PORT}"),
            backend_addr: "127.0.0.1:8080".to_string(),
            report_queue_depth: DEFAULT_QUEUE_DEPTH,
            dial_timeout_secs: 10,
            reconnect: ReconnectSettings::default(),
        }
    }
}

/// Backoff parameters for the worker's control-channel reconnects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectSettings {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

/// Load settings from `path`, or from the global settings file when no path
/// is given. A missing global file yields the defaults; a missing explicit
/// file is an error.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => load_config_file(path),
        None => match global_config_path() {
            Some(global) if global.exists() => load_config_file(&global),
            _ => Ok(Config::default()),
        },
    }
}

/// Path of the global settings file (`<config dir>/rproxy/settings.json`).
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("rproxy").join("settings.json"))
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}
