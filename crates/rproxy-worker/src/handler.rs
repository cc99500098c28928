//! Create-request handling: dial, pair, splice, report.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use rproxy_core::Tunnel;
use rproxy_proto::v1::{CreateRequest, Report};

use crate::dialer::{LegDialer, Legs};
use crate::tunnels::ActiveTunnels;

/// Turns create-requests into running tunnels and reports.
pub struct CreateRequestHandler {
    dialer: LegDialer,
    tunnels: Arc<ActiveTunnels>,
}

impl CreateRequestHandler {
    pub const fn new(dialer: LegDialer, tunnels: Arc<ActiveTunnels>) -> Self {
        Self { dialer, tunnels }
    }

    /// Open both legs for `request`, start splicing them and return the
    /// report for the reflector. Dial failures yield a failure report.
    ///
    /// The splice starts before the report is sent; bytes from the backend
    /// wait in the reflector's socket buffer until the pairing completes.
    pub async fn handle(&self, request: CreateRequest) -> Report {
        let CreateRequest { id, epoch } = request;
        let failed = Report {
            id,
            port: 0,
            epoch,
            failed: true,
        };

        let Legs { reflector, backend } = match self.dialer.open_legs().await {
            Ok(legs) => legs,
            Err(e) => {
                warn!(id, epoch, error = %e, "Could not open tunnel legs");
                return failed;
            }
        };
        let port = match reflector.local_addr() {
            Ok(addr) => addr.port(),
            Err(e) => {
                warn!(id, epoch, error = %e, "Reflector leg has no local address");
                return failed;
            }
        };

        let mut tunnel = Tunnel::new(id, reflector);
        if let Err(rejected) = tunnel.pair(backend) {
            warn!(id, epoch, error = %rejected, "Fresh tunnel refused its backend leg");
            return failed;
        }
        self.tunnels.spawn(epoch, tunnel).await;

        info!(id, epoch, port, "Tunnel legs open");
        Report {
            id,
            port: u32::from(port),
            epoch,
            failed: false,
        }
    }

    /// [`Self::handle`], then queue the report. A closed queue is logged.
    pub async fn handle_and_report(&self, request: CreateRequest, reports: &mpsc::Sender<Report>) {
        let report = self.handle(request).await;
        if reports.send(report).await.is_err() {
            warn!(id = report.id, "Report queue closed; dropping report");
        } else {
            debug!(id = report.id, port = report.port, failed = report.failed, "Report queued");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use crate::config::WorkerConfig;

    struct Fixture {
        handler: CreateRequestHandler,
        tunnels: Arc<ActiveTunnels>,
        reflector: TcpListener,
    }

    async fn fixture(backend_addr: String) -> Fixture {
        let reflector = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = WorkerConfig::new(
            String::new(),
            reflector.local_addr().unwrap().to_string(),
            backend_addr,
        );
        config.dial_timeout = Duration::from_secs(2);
        let tunnels = Arc::new(ActiveTunnels::new());
        Fixture {
            handler: CreateRequestHandler::new(LegDialer::new(&config), Arc::clone(&tunnels)),
            tunnels,
            reflector,
        }
    }

    #[tokio::test]
    async fn success_reports_reflector_leg_port() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let f = fixture(backend.local_addr().unwrap().to_string()).await;

        let report = f.handler.handle(CreateRequest { id: 4, epoch: 9 }).await;
        let (mut reflector_side, peer) = f.reflector.accept().await.unwrap();
        let (mut backend_side, _) = backend.accept().await.unwrap();

        assert_eq!(report.id, 4);
        assert_eq!(report.epoch, 9);
        assert!(!report.failed);
        assert_eq!(report.port, u32::from(peer.port()));
        assert_eq!(f.tunnels.len().await, 1);

        reflector_side.write_all(b"through").await.unwrap();
        let mut buf = [0u8; 7];
        tokio::time::timeout(Duration::from_secs(2), backend_side.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"through");
    }

    #[tokio::test]
    async fn dead_backend_reports_failure() {
        let gone = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = gone.local_addr().unwrap().to_string();
        drop(gone);
        let f = fixture(addr).await;

        let report = f.handler.handle(CreateRequest { id: 2, epoch: 1 }).await;
        assert!(report.failed);
        assert_eq!((report.id, report.epoch, report.port), (2, 1, 0));
        assert!(f.tunnels.is_empty().await);
    }

    #[tokio::test]
    async fn report_lands_in_queue() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let f = fixture(backend.local_addr().unwrap().to_string()).await;
        let (tx, mut rx) = mpsc::channel(4);

        f.handler
            .handle_and_report(CreateRequest { id: 0, epoch: 1 }, &tx)
            .await;
        let report = rx.recv().await.unwrap();
        assert_eq!(report.id, 0);
        assert!(!report.failed);
    }
}
