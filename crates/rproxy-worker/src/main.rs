//! rproxy Worker
//!
//! Keeps a control session with the reflector and opens tunnel legs to the
//! local backend on request.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use rproxy_core::config::{WorkerSettings, load_config};
use rproxy_core::tracing_init::{default_filter, init_tracing};

use rproxy_worker::{Worker, WorkerConfig};

#[derive(Parser, Debug)]
#[command(name = "rproxy-worker")]
#[command(version, about = "rproxy worker - outbound agent that opens tunnel legs to a local backend")]
struct Args {
    /// Reflector control API URL (e.g., http://reflector.example:7779).
    #[arg(long, env = "RPROXY_CONTROL_URL")]
    control_url: Option<String>,

    /// Reflector worker-data address, host:port.
    #[arg(long, env = "RPROXY_REFLECTOR_DATA_ADDR")]
    reflector_data_addr: Option<String>,

    /// Local backend address, host:port.
    #[arg(long, env = "RPROXY_BACKEND_ADDR")]
    backend_addr: Option<String>,

    /// Timeout for each outbound dial, in seconds.
    #[arg(long, env = "RPROXY_DIAL_TIMEOUT_SECS")]
    dial_timeout_secs: Option<u64>,

    /// Settings file (defaults to the global rproxy settings file).
    #[arg(long, env = "RPROXY_CONFIG")]
    config: Option<PathBuf>,

    /// Log level used when RUST_LOG is not set.
    #[arg(long, env = "RPROXY_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "RPROXY_LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn apply(&self, settings: &mut WorkerSettings) {
        if let Some(url) = &self.control_url {
            settings.control_url.clone_from(url);
        }
        if let Some(addr) = &self.reflector_data_addr {
            settings.reflector_data_addr.clone_from(addr);
        }
        if let Some(addr) = &self.backend_addr {
            settings.backend_addr.clone_from(addr);
        }
        if let Some(secs) = self.dial_timeout_secs {
            settings.dial_timeout_secs = secs;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&default_filter("rproxy_worker", &args.log_level), args.log_json);

    let mut settings = load_config(args.config.as_deref())
        .context("failed to load rproxy settings")?
        .worker;
    args.apply(&mut settings);
    let config = WorkerConfig::from(&settings);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        control_url = %config.control_url,
        reflector_data_addr = %config.reflector_data_addr,
        backend_addr = %config.backend_addr,
        "Starting rproxy-worker"
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let worker = Worker::new(config);
    let run = worker.run(shutdown_rx);
    tokio::pin!(run);

    tokio::select! {
        () = &mut run => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
            let _ = shutdown_tx.send(true);
            // Let the worker close its session.
            if tokio::time::timeout(Duration::from_secs(5), &mut run).await.is_err() {
                info!("Timed out waiting for the session to close");
            }
        }
    }

    let aborted = worker.abort_tunnels().await;
    info!(aborted_tunnels = aborted, "rproxy-worker stopped");
    Ok(())
}
