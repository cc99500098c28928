//! Worker data connections waiting for their report.
//!
//! A data connection is anonymous when accepted; the only thing tying it to
//! a tunnel is its remote port, which the worker reports over the control
//! channel. Entries are keyed by that port, at most one per port, and the
//! whole map belongs to one session epoch.

use std::collections::HashMap;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{Notify, RwLock};
use tokio::time::Instant;

struct PendingConnection<S> {
    stream: S,
    since: Instant,
}

struct PendingMap<S> {
    epoch: u64,
    entries: HashMap<u16, PendingConnection<S>>,
}

/// Pending data connections keyed by remote port.
pub struct PendingConnections<S = TcpStream> {
    conns: RwLock<PendingMap<S>>,
    arrived: Notify,
}

impl<S> PendingConnections<S> {
    pub fn new() -> Self {
        Self {
            conns: RwLock::new(PendingMap {
                epoch: 0,
                entries: HashMap::new(),
            }),
            arrived: Notify::new(),
        }
    }

    pub async fn epoch(&self) -> u64 {
        self.conns.read().await.epoch
    }

    /// Park `stream` under `port` for session `epoch`.
    ///
    /// Returns the stream it replaced, if any. When `epoch` is not the map's
    /// epoch the stream is handed back as the error.
    pub async fn insert(&self, epoch: u64, port: u16, stream: S) -> Result<Option<S>, S> {
        let replaced = {
            let mut conns = self.conns.write().await;
            if conns.epoch != epoch {
                return Err(stream);
            }
            conns.entries.insert(
                port,
                PendingConnection {
                    stream,
                    since: Instant::now(),
                },
            )
        };
        self.arrived.notify_waiters();
        Ok(replaced.map(|p| p.stream))
    }

    /// Remove and return the connection parked under `port`, provided the
    /// map still belongs to `epoch`.
    pub async fn take(&self, epoch: u64, port: u16) -> Option<S> {
        let mut conns = self.conns.write().await;
        if conns.epoch != epoch {
            return None;
        }
        conns.entries.remove(&port).map(|p| p.stream)
    }

    /// Like [`Self::take`], but waits up to `grace` for the port to arrive.
    pub async fn take_within(&self, epoch: u64, port: u16, grace: Duration) -> Option<S> {
        let deadline = Instant::now() + grace;
        loop {
            let notified = self.arrived.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(stream) = self.take(epoch, port).await {
                return Some(stream);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.take(epoch, port).await;
            }
        }
    }

    pub async fn contains(&self, port: u16) -> bool {
        self.conns.read().await.entries.contains_key(&port)
    }

    pub async fn len(&self) -> usize {
        self.conns.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.conns.read().await.entries.is_empty()
    }

    /// Start over empty for session `epoch`. Returns the discarded
    /// connections so the caller can close them outside the lock.
    pub async fn reset(&self, epoch: u64) -> Vec<S> {
        let stale = {
            let mut conns = self.conns.write().await;
            conns.epoch = epoch;
            std::mem::take(&mut conns.entries)
        };
        self.arrived.notify_waiters();
        stale.into_values().map(|p| p.stream).collect()
    }

    /// Remove entries parked for longer than `ttl`.
    pub async fn evict_older_than(&self, ttl: Duration) -> Vec<S> {
        let mut conns = self.conns.write().await;
        let expired: Vec<u16> = conns
            .entries
            .iter()
            .filter(|(_, p)| p.since.elapsed() >= ttl)
            .map(|(port, _)| *port)
            .collect();
        expired
            .into_iter()
            .filter_map(|port| conns.entries.remove(&port))
            .map(|p| p.stream)
            .collect()
    }
}

impl<S> Default for PendingConnections<S> {
    fn default() -> Self {
        Self::new()
    }
}
