//! The reflector: pairs public clients with worker data connections.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, RwLock, watch};
use tokio::time::MissedTickBehavior;
use tokio_stream::Stream;
use tracing::{debug, info, warn};

use rproxy_core::Tunnel;
use rproxy_proto::v1::{CreateRequest, Report};

use crate::config::ReflectorConfig;
use crate::error::ReflectorError;
use crate::pending::PendingConnections;
use crate::queue::CreateQueue;
use crate::session::{Session, SessionTracker};
use crate::tunnels::{PairRejection, TunnelTable};

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// What became of a worker report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    /// Paired and splicing.
    Spliced,
    /// The data connection has not been accepted yet; matching continues in
    /// the background for the report grace period.
    Deferred,
    /// The worker could not open the legs; the client was closed.
    Failed,
    UnknownPort,
    UnknownTunnel,
    AlreadyPaired,
    StaleEpoch,
}

/// Point-in-time view of the reflector's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReflectorStats {
    /// Epoch of the current tunnel table; 0 before the first session.
    pub epoch: u64,
    pub session_open: bool,
    pub pending_tunnels: usize,
    pub pending_connections: usize,
    pub queued_requests: usize,
    pub active_splices: usize,
}

pub struct Reflector {
    config: ReflectorConfig,
    sessions: SessionTracker,
    /// Serializes session transitions.
    session_lock: Mutex<()>,
    tunnels: RwLock<TunnelTable>,
    pending: PendingConnections,
    queue: CreateQueue,
    active_splices: Arc<AtomicUsize>,
}

impl Reflector {
    pub fn new(config: ReflectorConfig) -> Self {
        let queue = CreateQueue::new(config.queue_depth);
        Self {
            config,
            sessions: SessionTracker::new(),
            session_lock: Mutex::new(()),
            tunnels: RwLock::new(TunnelTable::new(0)),
            pending: PendingConnections::new(),
            queue,
            active_splices: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub const fn config(&self) -> &ReflectorConfig {
        &self.config
    }

    pub fn current_session(&self) -> Option<Session> {
        self.sessions.current()
    }

    /// Receiver that observes every session transition.
    pub fn watch_sessions(&self) -> watch::Receiver<Option<Session>> {
        self.sessions.subscribe()
    }

    // -- Session transitions ---------------------------------------------

    /// Start a new session for the worker at `worker_addr`, replacing any
    /// current one. Every pending tunnel and data connection of the previous
    /// epoch is discarded and closed.
    pub async fn open_session(&self, worker_addr: Option<SocketAddr>) -> Session {
        let _transition = self.session_lock.lock().await;
        let epoch = self.sessions.next_epoch();

        let stale_tunnels = {
            let mut tunnels = self.tunnels.write().await;
            std::mem::replace(&mut *tunnels, TunnelTable::new(epoch))
        };
        let stale_conns = self.pending.reset(epoch).await;

        let session = Session { epoch, worker_addr };
        let previous = self.sessions.current();
        self.sessions.publish(session.clone());

        info!(
            epoch,
            worker = ?worker_addr,
            replaced = ?previous.map(|s| s.epoch),
            dropped_tunnels = stale_tunnels.len(),
            dropped_connections = stale_conns.len(),
            "Worker session opened"
        );
        session
    }

    /// Clear the active session. Running tunnels are left alone.
    pub async fn close_session(&self) -> Option<Session> {
        let _transition = self.session_lock.lock().await;
        let closed = self.sessions.clear();
        match &closed {
            Some(session) => info!(epoch = session.epoch, "Worker session closed"),
            None => debug!("Close requested with no active session"),
        }
        closed
    }

    /// End session `epoch` after its control stream broke. Does nothing if
    /// another session has taken over meanwhile.
    pub fn on_control_stream_lost(&self, epoch: u64) {
        if self.sessions.clear_if(epoch) {
            warn!(epoch, "Control stream lost; session closed");
        }
    }

    /// Create-request stream for the current session.
    pub fn create_request_stream(
        &self,
    ) -> Result<(u64, impl Stream<Item = CreateRequest> + Send + 'static), ReflectorError> {
        let session = self.sessions.current().ok_or(ReflectorError::NoSession)?;
        let stream = self
            .queue
            .subscribe(session.epoch, self.sessions.subscribe());
        Ok((session.epoch, stream))
    }

    // -- Client side -----------------------------------------------------

    /// Store `client` as a pending tunnel and queue a create-request for it.
    /// Waits while the create-request queue is full.
    pub async fn register_client(&self, client: TcpStream) -> Result<CreateRequest, ReflectorError> {
        if self.sessions.current().is_none() {
            return Err(ReflectorError::NoSession);
        }
        let request = {
            let mut tunnels = self.tunnels.write().await;
            let id = tunnels.register(client);
            CreateRequest {
                id,
                epoch: tunnels.epoch(),
            }
        };
        self.queue.push(request).await;
        Ok(request)
    }

    /// Accept clients whenever a session is active.
    pub async fn serve_clients(&self, listener: TcpListener) {
        loop {
            self.sessions.wait_active().await;

            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Client accept failed");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    continue;
                }
            };

            match self.register_client(stream).await {
                Ok(request) => {
                    debug!(id = request.id, epoch = request.epoch, %peer, "Client registered");
                }
                Err(e) => warn!(%peer, error = %e, "Dropping client"),
            }
        }
    }

    // -- Worker data side ------------------------------------------------

    /// Park a freshly accepted worker data connection under its remote port.
    pub async fn register_data_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let Some(session) = self.sessions.current() else {
            warn!(%peer, "Data connection without an active session; closing");
            return;
        };
        if let Some(worker) = session.worker_addr
            && worker.ip() != peer.ip()
        {
            warn!(%peer, worker = %worker, "Data connection from unexpected address");
        }

        match self.pending.insert(session.epoch, peer.port(), stream).await {
            Ok(None) => debug!(port = peer.port(), epoch = session.epoch, "Data connection pending"),
            Ok(Some(_stale)) => {
                warn!(port = peer.port(), "Replaced pending data connection on reused port");
            }
            Err(_stream) => {
                debug!(%peer, epoch = session.epoch, "Data connection from superseded session; closing");
            }
        }
    }

    /// Accept worker data connections forever.
    pub async fn serve_worker_data(&self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => self.register_data_connection(stream, peer).await,
                Err(e) => {
                    warn!(error = %e, "Worker data accept failed");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }

    // -- Reports ---------------------------------------------------------

    /// Handle one worker report.
    pub async fn on_report(self: &Arc<Self>, report: Report) -> ReportOutcome {
        let Report {
            id,
            port,
            epoch,
            failed,
        } = report;

        let table_epoch = self.tunnels.read().await.epoch();
        if epoch != table_epoch {
            debug!(id, epoch, current = table_epoch, "Ignoring report from another session");
            return ReportOutcome::StaleEpoch;
        }

        if failed {
            return self.fail(id, epoch).await;
        }

        let Ok(port) = u16::try_from(port) else {
            warn!(id, port, "Report carries an invalid port");
            return ReportOutcome::UnknownPort;
        };

        if let Some(conn) = self.pending.take(epoch, port).await {
            return self.complete(id, epoch, conn).await;
        }

        let grace = self.config.report_grace;
        if grace.is_zero() {
            warn!(id, port, epoch, "No data connection for report; dropping");
            return ReportOutcome::UnknownPort;
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            match this.pending.take_within(epoch, port, grace).await {
                Some(conn) => {
                    this.complete(id, epoch, conn).await;
                }
                None => warn!(id, port, epoch, "No data connection for report; dropping"),
            }
        });
        ReportOutcome::Deferred
    }

    async fn fail(&self, id: u32, epoch: u64) -> ReportOutcome {
        let removed = {
            let mut tunnels = self.tunnels.write().await;
            if tunnels.epoch() != epoch {
                return ReportOutcome::StaleEpoch;
            }
            tunnels.remove(id)
        };
        if removed.is_some() {
            warn!(id, epoch, "Worker could not open tunnel; closing client");
            ReportOutcome::Failed
        } else {
            debug!(id, epoch, "Failure report for unknown tunnel");
            ReportOutcome::UnknownTunnel
        }
    }

    /// Pair tunnel `id` with `conn` and start splicing. A connection that
    /// cannot be paired is closed.
    async fn complete(&self, id: u32, epoch: u64, conn: TcpStream) -> ReportOutcome {
        let paired = {
            let mut tunnels = self.tunnels.write().await;
            if tunnels.epoch() != epoch {
                debug!(id, epoch, "Session changed before pairing; closing data connection");
                return ReportOutcome::StaleEpoch;
            }
            tunnels.pair(id, conn)
        };

        match paired {
            Ok(tunnel) => {
                self.spawn_splice(tunnel, epoch);
                ReportOutcome::Spliced
            }
            Err(PairRejection::UnknownTunnel { .. }) => {
                warn!(id, epoch, "Report for unknown tunnel; closing data connection");
                ReportOutcome::UnknownTunnel
            }
            Err(PairRejection::AlreadyPaired { .. }) => {
                warn!(id, epoch, "Tunnel already paired; closing data connection");
                ReportOutcome::AlreadyPaired
            }
        }
    }

    fn spawn_splice(&self, mut tunnel: Tunnel<TcpStream>, epoch: u64) {
        let active = Arc::clone(&self.active_splices);
        active.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            let id = tunnel.id();
            match tunnel.run().await {
                Ok(summary) => debug!(
                    id,
                    epoch,
                    client_to_worker = summary.forward.bytes,
                    worker_to_client = summary.backward.bytes,
                    "Splice finished"
                ),
                Err(e) => warn!(id, epoch, error = %e, "Splice could not start"),
            }
            active.fetch_sub(1, Ordering::SeqCst);
        });
    }

    // -- Housekeeping ----------------------------------------------------

    /// Close pending tunnels and data connections older than the TTL.
    /// Returns how many of each were evicted.
    pub async fn sweep_expired(&self) -> (usize, usize) {
        let ttl = self.config.pending_ttl;
        let tunnels = self.tunnels.write().await.evict_older_than(ttl);
        let conns = self.pending.evict_older_than(ttl).await;
        if !tunnels.is_empty() || !conns.is_empty() {
            info!(
                tunnels = tunnels.len(),
                connections = conns.len(),
                "Evicted expired pending entries"
            );
        }
        (tunnels.len(), conns.len())
    }

    /// Run [`Self::sweep_expired`] every sweep interval, forever.
    pub async fn run_sweeper(&self) {
        let mut timer = tokio::time::interval(self.config.sweep_interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        timer.tick().await;
        loop {
            timer.tick().await;
            self.sweep_expired().await;
        }
    }

    pub async fn stats(&self) -> ReflectorStats {
        let (epoch, pending_tunnels) = {
            let tunnels = self.tunnels.read().await;
            (tunnels.epoch(), tunnels.len())
        };
        ReflectorStats {
            epoch,
            session_open: self.sessions.current().is_some(),
            pending_tunnels,
            pending_connections: self.pending.len().await,
            queued_requests: self.queue.len(),
            active_splices: self.active_splices.load(Ordering::SeqCst),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
#[path = "reflector_tests.rs"]
mod tests;
