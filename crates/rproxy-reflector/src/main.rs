//! rproxy Reflector
//!
//! Public rendezvous broker: accepts clients, asks the worker for matching
//! legs over gRPC and splices the two together.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tonic::transport::Server;
use tracing::{error, info};

use rproxy_core::config::{ReflectorSettings, load_config};
use rproxy_core::tracing_init::{default_filter, init_tracing};
use rproxy_proto::v1::control_service_server::ControlServiceServer;

use rproxy_reflector::server::ControlServiceImpl;
use rproxy_reflector::{Reflector, ReflectorConfig};

#[derive(Parser, Debug)]
#[command(name = "rproxy-reflector")]
#[command(version, about = "rproxy reflector - public rendezvous broker for reverse tunnels")]
struct Args {
    /// Client-facing listen address.
    #[arg(long, env = "RPROXY_CLIENT_ADDR")]
    client_addr: Option<SocketAddr>,

    /// Listen address for worker data connections.
    #[arg(long, env = "RPROXY_WORKER_ADDR")]
    worker_addr: Option<SocketAddr>,

    /// gRPC control API listen address.
    #[arg(long, env = "RPROXY_API_ADDR")]
    api_addr: Option<SocketAddr>,

    /// Seconds a tunnel or data connection may stay unpaired.
    #[arg(long, env = "RPROXY_PENDING_TTL_SECS")]
    pending_ttl_secs: Option<u64>,

    /// Milliseconds a report may wait for its data connection (0 disables).
    #[arg(long, env = "RPROXY_REPORT_GRACE_MS")]
    report_grace_ms: Option<u64>,

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
    fn apply(&self, settings: &mut ReflectorSettings) {
        if let Some(addr) = self.client_addr {
            settings.client_addr = addr;
        }
        if let Some(addr) = self.worker_addr {
            settings.worker_addr = addr;
        }
        if let Some(addr) = self.api_addr {
            settings.api_addr = addr;
        }
        if let Some(ttl) = self.pending_ttl_secs {
            settings.pending_ttl_secs = ttl;
        }
        if let Some(grace) = self.report_grace_ms {
            settings.report_grace_ms = grace;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(
        &default_filter("rproxy_reflector", &args.log_level),
        args.log_json,
    );

    let mut settings = load_config(args.config.as_deref())
        .context("failed to load rproxy settings")?
        .reflector;
    args.apply(&mut settings);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        client_addr = %settings.client_addr,
        worker_addr = %settings.worker_addr,
        api_addr = %settings.api_addr,
        "Starting rproxy-reflector"
    );

    let client_listener = TcpListener::bind(settings.client_addr).await?;
    let worker_listener = TcpListener::bind(settings.worker_addr).await?;
    let reflector = Arc::new(Reflector::new(ReflectorConfig::from(&settings)));

    let clients = {
        let reflector = Arc::clone(&reflector);
        tokio::spawn(async move { reflector.serve_clients(client_listener).await })
    };
    let worker_data = {
        let reflector = Arc::clone(&reflector);
        tokio::spawn(async move { reflector.serve_worker_data(worker_listener).await })
    };
    let sweeper = {
        let reflector = Arc::clone(&reflector);
        tokio::spawn(async move { reflector.run_sweeper().await })
    };

    let control = ControlServiceImpl::new(Arc::clone(&reflector));
    let grpc = Server::builder()
        .http2_keepalive_interval(Some(Duration::from_secs(30)))
        .http2_keepalive_timeout(Some(Duration::from_secs(10)))
        .add_service(ControlServiceServer::new(control))
        .serve(settings.api_addr);

    info!(addr = %settings.api_addr, "Control API listening");

    tokio::select! {
        result = grpc => {
            if let Err(e) = result {
                error!(error = %e, "Control API server failed");
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    clients.abort();
    worker_data.abort();
    sweeper.abort();
    info!(stats = ?reflector.stats().await, "rproxy-reflector stopped");
    Ok(())
}
