//! Tunnel splicing.
//!
//! A [`Tunnel`] owns up to two legs. It is created with its first leg,
//! paired exactly once with a second leg, and then [`Tunnel::run`] copies
//! bytes both ways until either side ends. Whichever direction finishes
//! first tears down both legs so the other direction ends too.

use std::fmt;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

const COPY_BUFFER_SIZE: usize = 16 * 1024;

/// One endpoint of a tunnel.
pub trait Leg: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    /// Short human-readable description used in logs.
    fn describe(&self) -> String;
}

impl Leg for TcpStream {
    fn describe(&self) -> String {
        self.peer_addr()
            .map_or_else(|_| "disconnected peer".to_string(), |addr| addr.to_string())
    }
}

impl Leg for DuplexStream {
    fn describe(&self) -> String {
        "in-memory duplex".to_string()
    }
}

/// Lifecycle of a [`Tunnel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    /// Only the first leg is set.
    Pending,
    /// Both legs are set.
    Completed,
    /// The splice is copying bytes.
    Running,
    /// Both legs have been closed.
    Closed,
}

/// Returned by [`Tunnel::pair`] when the tunnel already has its second leg.
///
/// The rejected leg is handed back; closing it is the caller's job.
#[derive(thiserror::Error)]
#[error("tunnel {id} is already paired")]
pub struct AlreadyPaired<S> {
    pub id: u32,
    pub leg: S,
}

impl<S> fmt::Debug for AlreadyPaired<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlreadyPaired")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Why one copy direction stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectionEnd {
    /// The source reached end-of-stream.
    Eof,
    /// The opposite direction ended first and the legs were torn down.
    TornDown,
    /// Reading or writing failed.
    Error(std::io::ErrorKind),
    /// The copy task panicked or was cancelled.
    Aborted,
}

/// Outcome of one copy direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectionSummary {
    pub bytes: u64,
    pub end: DirectionEnd,
}

/// Outcome of a whole splice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpliceSummary {
    pub id: u32,
    /// First leg to second leg.
    pub forward: DirectionSummary,
    /// Second leg to first leg.
    pub backward: DirectionSummary,
}

/// A bidirectional circuit between two legs.
pub struct Tunnel<S> {
    id: u32,
    first: Option<S>,
    second: Option<S>,
    state: TunnelState,
}

impl<S> Tunnel<S> {
    /// Create a pending tunnel holding its first leg.
    pub const fn new(id: u32, first: S) -> Self {
        Self {
            id,
            first: Some(first),
            second: None,
            state: TunnelState::Pending,
        }
    }

    pub const fn id(&self) -> u32 {
        self.id
    }

    pub const fn state(&self) -> TunnelState {
        self.state
    }

    /// Set the second leg. Succeeds at most once; afterwards the offered leg
    /// is returned untouched inside the error and the tunnel is unchanged.
    pub fn pair(&mut self, second: S) -> std::result::Result<(), AlreadyPaired<S>> {
        if self.state != TunnelState::Pending || self.second.is_some() {
            return Err(AlreadyPaired {
                id: self.id,
                leg: second,
            });
        }
        self.second = Some(second);
        self.state = TunnelState::Completed;
        Ok(())
    }
}

impl<S: Leg> Tunnel<S> {
    /// Splice the two legs until either ends, then close both.
    ///
    /// Copy failures are logged and reported in the summary, never returned
    /// as errors; the only error is calling this before the tunnel is paired.
    pub async fn run(&mut self) -> Result<SpliceSummary> {
        if self.state != TunnelState::Completed {
            return Err(Error::TunnelNotReady {
                id: self.id,
                state: self.state,
            });
        }
        let (Some(first), Some(second)) = (self.first.take(), self.second.take()) else {
            return Err(Error::TunnelNotReady {
                id: self.id,
                state: self.state,
            });
        };

        let id = self.id;
        let first_label = first.describe();
        let second_label = second.describe();
        self.state = TunnelState::Running;
        info!(id, first = %first_label, second = %second_label, "Tunnel started");

        let (first_read, first_write) = tokio::io::split(first);
        let (second_read, second_write) = tokio::io::split(second);
        let (teardown_tx, teardown_rx) = watch::channel(false);
        let teardown_tx = Arc::new(teardown_tx);
        let _teardown_on_drop = TeardownOnDrop(Arc::clone(&teardown_tx));

        let forward = tokio::spawn(pump(
            Direction::new(id, &first_label, &second_label),
            first_read,
            second_write,
            teardown_rx.clone(),
            Arc::clone(&teardown_tx),
        ));
        let backward = tokio::spawn(pump(
            Direction::new(id, &second_label, &first_label),
            second_read,
            first_write,
            teardown_rx,
            Arc::clone(&teardown_tx),
        ));

        let forward = forward.await.unwrap_or_else(|e| {
            warn!(id, error = %e, "Forward copy task failed");
            DirectionSummary {
                bytes: 0,
                end: DirectionEnd::Aborted,
            }
        });
        let backward = backward.await.unwrap_or_else(|e| {
            warn!(id, error = %e, "Backward copy task failed");
            DirectionSummary {
                bytes: 0,
                end: DirectionEnd::Aborted,
            }
        });

        self.state = TunnelState::Closed;
        info!(
            id,
            first = %first_label,
            second = %second_label,
            bytes_forward = forward.bytes,
            bytes_backward = backward.bytes,
            "Tunnel ended"
        );
        Ok(SpliceSummary {
            id,
            forward,
            backward,
        })
    }
}

impl<S> fmt::Debug for Tunnel<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tunnel")
            .field("id", &self.id)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// Stops both copy tasks if the `run` future is dropped early.
struct TeardownOnDrop(Arc<watch::Sender<bool>>);

impl Drop for TeardownOnDrop {
    fn drop(&mut self) {
        self.0.send_replace(true);
    }
}

struct Direction {
    id: u32,
    from: String,
    to: String,
}

impl Direction {
    fn new(id: u32, from: &str, to: &str) -> Self {
        Self {
            id,
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

/// Copy `from` into `to` until EOF, an error, or teardown. Signals teardown
/// on the way out and shuts the write side down.
async fn pump<R, W>(
    direction: Direction,
    mut from: R,
    mut to: W,
    mut teardown: watch::Receiver<bool>,
    teardown_tx: Arc<watch::Sender<bool>>,
) -> DirectionSummary
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut bytes = 0u64;

    let end = loop {
        let n = tokio::select! {
            read = from.read(&mut buf) => match read {
                Ok(0) => break DirectionEnd::Eof,
                Ok(n) => n,
                Err(e) => break DirectionEnd::Error(e.kind()),
            },
            _ = teardown.changed() => break DirectionEnd::TornDown,
        };
        tokio::select! {
            written = to.write_all(&buf[..n]) => {
                if let Err(e) = written {
                    break DirectionEnd::Error(e.kind());
                }
            }
            _ = teardown.changed() => break DirectionEnd::TornDown,
        }
        bytes += n as u64;
    };

    teardown_tx.send_replace(true);
    if let Err(e) = to.shutdown().await {
        debug!(id = direction.id, error = %e, "Shutdown after copy failed");
    }

    info!(
        id = direction.id,
        from = %direction.from,
        to = %direction.to,
        bytes,
        end = ?end,
        "Copy direction ended"
    );
    DirectionSummary { bytes, end }
}
