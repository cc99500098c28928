//! Worker control client with supervised reconnects.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::Channel;
use tonic::{Response, Status, Streaming};
use tracing::{debug, error, info, warn};

use rproxy_proto::v1::control_service_client::ControlServiceClient;
use rproxy_proto::v1::{CreateRequest, Empty, Report};

use crate::config::WorkerConfig;
use crate::dialer::LegDialer;
use crate::error::WorkerError;
use crate::handler::CreateRequestHandler;
use crate::tunnels::ActiveTunnels;

/// A connection that stayed up this long resets the backoff.
const STABLE_CONNECTION: Duration = Duration::from_secs(60);

/// HTTP/2 receive window for control streams. Kept small so that
/// create-requests stay in the reflector's bounded queue until the worker
/// is ready for them, instead of piling up in transport buffers.
const CONTROL_STREAM_WINDOW: u32 = 64;

type ReportCall = JoinHandle<Result<Response<Empty>, Status>>;

/// The worker: keeps one session with the reflector and serves its
/// create-requests.
pub struct Worker {
    config: WorkerConfig,
    handler: CreateRequestHandler,
    tunnels: Arc<ActiveTunnels>,
}

impl Worker {
    pub fn new(config: WorkerConfig) -> Self {
        let tunnels = Arc::new(ActiveTunnels::new());
        let handler = CreateRequestHandler::new(LegDialer::new(&config), Arc::clone(&tunnels));
        Self {
            config,
            handler,
            tunnels,
        }
    }

    /// Number of splices currently running.
    pub async fn active_tunnels(&self) -> usize {
        self.tunnels.len().await
    }

    /// Abort every running splice. Returns how many were stopped.
    pub async fn abort_tunnels(&self) -> usize {
        self.tunnels.abort_all().await
    }

    /// Run the worker with automatic reconnection until `shutdown` fires or
    /// the reconnect policy gives up.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut attempt: u32 = 0;

        loop {
            if *shutdown.borrow() {
                info!("Worker shutting down");
                return;
            }

            let started = Instant::now();
            match self.connect_and_run(&mut shutdown).await {
                Ok(()) => {
                    info!("Control connection closed cleanly");
                    return;
                }
                Err(e) => {
                    if started.elapsed() > STABLE_CONNECTION {
                        attempt = 0;
                    }

                    if !self.config.reconnect.should_retry(attempt) {
                        error!(error = %e, attempt, "Max reconnect attempts reached");
                        return;
                    }

                    let delay = self.config.reconnect.delay_for_attempt(attempt);
                    warn!(error = %e, attempt, delay_ms = delay.as_millis(), "Reconnecting");

                    tokio::select! {
                        () = sleep(delay) => {}
                        _ = shutdown.changed() => {
                            info!("Worker shutting down during reconnect wait");
                            return;
                        }
                    }

                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    /// Connect, open a session and both streams, then serve create-requests
    /// until the session breaks or shutdown fires.
    async fn connect_and_run(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), WorkerError> {
        let channel = Channel::from_shared(self.config.control_url.clone())
            .map_err(|e| WorkerError::Connection(e.to_string()))?
            .http2_keep_alive_interval(Duration::from_secs(30))
            .keep_alive_timeout(Duration::from_secs(10))
            .initial_stream_window_size(CONTROL_STREAM_WINDOW)
            .connect_timeout(self.config.dial_timeout)
            .connect()
            .await
            .map_err(|e| {
                debug!(error = ?e, "connection error details");
                WorkerError::Connection(format!("{e}: {}", error_chain(&e)))
            })?;
        let mut control = ControlServiceClient::new(channel);

        let epoch = control
            .open_session(Empty {})
            .await
            .map_err(|e| WorkerError::Session(e.to_string()))?
            .into_inner()
            .epoch;
        let requests = control
            .push_create_requests(Empty {})
            .await
            .map_err(|e| WorkerError::Stream(e.to_string()))?
            .into_inner();

        let (report_tx, report_rx) = mpsc::channel(self.config.report_queue_depth);
        let (sink_tx, sink_rx) = mpsc::channel(1);
        let mut report_call: ReportCall = {
            let mut control = control.clone();
            tokio::spawn(async move { control.push_reports(ReceiverStream::new(sink_rx)).await })
        };
        let forwarder = tokio::spawn(report_loop(report_rx, sink_tx));

        info!(url = %self.config.control_url, epoch, "Worker session open");

        let result = self
            .session_loop(epoch, requests, &report_tx, &mut report_call, shutdown)
            .await;

        if result.is_ok() {
            // Best effort: the reflector also ends the session when the
            // report stream drops.
            if let Err(e) = control.close_session(Empty {}).await {
                debug!(error = %e, "CloseSession failed during shutdown");
            }
        }
        forwarder.abort();
        report_call.abort();
        result
    }

    async fn session_loop(
        &self,
        epoch: u64,
        mut requests: Streaming<CreateRequest>,
        reports: &mpsc::Sender<Report>,
        report_call: &mut ReportCall,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), WorkerError> {
        loop {
            tokio::select! {
                next = requests.message() => match next {
                    Ok(Some(request)) => {
                        if request.epoch != epoch {
                            debug!(id = request.id, epoch = request.epoch, current = epoch,
                                "Ignoring create request from another session");
                            continue;
                        }
                        // One request at a time; the next is read only after this
                        // one's legs are dialed.
                        tokio::select! {
                            () = self.handler.handle_and_report(request, reports) => {}
                            _ = shutdown.changed() => {
                                info!(epoch, id = request.id, "Worker received shutdown signal");
                                return Ok(());
                            }
                        }
                    }
                    Ok(None) => {
                        return Err(WorkerError::Stream(
                            "Create-request stream ended by reflector".into(),
                        ));
                    }
                    Err(status) => return Err(WorkerError::Stream(status.to_string())),
                },
                call = &mut *report_call => {
                    let reason = match call {
                        Ok(Ok(_)) => "ended by reflector".to_string(),
                        Ok(Err(status)) => status.to_string(),
                        Err(e) => e.to_string(),
                    };
                    return Err(WorkerError::Stream(format!("Report stream closed: {reason}")));
                }
                _ = shutdown.changed() => {
                    info!(epoch, "Worker received shutdown signal");
                    return Ok(());
                }
            }
        }
    }
}

/// Drain the report queue onto the report stream, in order. A failed send
/// drops that report and keeps draining so handlers never block on a dead
/// stream.
async fn report_loop(mut queue: mpsc::Receiver<Report>, sink: mpsc::Sender<Report>) {
    while let Some(report) = queue.recv().await {
        if sink.send(report).await.is_err() {
            warn!(id = report.id, epoch = report.epoch, "Report stream closed; report dropped");
        }
    }
}

/// Walk the `source()` chain of an error and join into a single string.
fn error_chain(err: &dyn std::error::Error) -> String {
    let mut chain = Vec::new();
    let mut current = err.source();
    while let Some(e) = current {
        chain.push(e.to_string());
        current = e.source();
    }
    if chain.is_empty() {
        String::from("(no further details)")
    } else {
        chain.join(" -> ")
    }
}
