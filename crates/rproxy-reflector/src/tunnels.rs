//! Client-side tunnels waiting for their worker leg.

use std::collections::HashMap;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::Instant;

use rproxy_core::tunnel::{AlreadyPaired, Tunnel};

struct PendingTunnel<S> {
    tunnel: Tunnel<S>,
    since: Instant,
}

/// Why [`TunnelTable::pair`] refused a leg. The leg is handed back.
#[derive(Debug)]
pub enum PairRejection<S> {
    UnknownTunnel { id: u32, leg: S },
    AlreadyPaired { id: u32, leg: S },
}

/// Pending tunnels of one session epoch, keyed by id.
///
/// Ids are allocated from zero upwards and only start over when a new
/// session replaces the whole table.
pub struct TunnelTable<S = TcpStream> {
    epoch: u64,
    next_id: u32,
    tunnels: HashMap<u32, PendingTunnel<S>>,
}

impl<S> TunnelTable<S> {
    pub fn new(epoch: u64) -> Self {
        Self {
            epoch,
            next_id: 0,
            tunnels: HashMap::new(),
        }
    }

    pub const fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }

    pub fn contains(&self, id: u32) -> bool {
        self.tunnels.contains_key(&id)
    }

    /// Store a new pending tunnel for `client` and return its id.
    pub fn register(&mut self, client: S) -> u32 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        self.tunnels.insert(
            id,
            PendingTunnel {
                tunnel: Tunnel::new(id, client),
                since: Instant::now(),
            },
        );
        id
    }

    /// Pair tunnel `id` with `leg`. On success the tunnel leaves the table
    /// and is returned ready to run; on failure the table is unchanged.
    pub fn pair(&mut self, id: u32, leg: S) -> Result<Tunnel<S>, PairRejection<S>> {
        let Some(mut entry) = self.tunnels.remove(&id) else {
            return Err(PairRejection::UnknownTunnel { id, leg });
        };
        match entry.tunnel.pair(leg) {
            Ok(()) => Ok(entry.tunnel),
            Err(AlreadyPaired { leg, .. }) => {
                self.tunnels.insert(id, entry);
                Err(PairRejection::AlreadyPaired { id, leg })
            }
        }
    }

    /// Drop tunnel `id` without pairing it.
    pub fn remove(&mut self, id: u32) -> Option<Tunnel<S>> {
        self.tunnels.remove(&id).map(|entry| entry.tunnel)
    }

    /// Remove tunnels that have been pending for longer than `ttl`.
    pub fn evict_older_than(&mut self, ttl: Duration) -> Vec<Tunnel<S>> {
        let expired: Vec<u32> = self
            .tunnels
            .iter()
            .filter(|(_, entry)| entry.since.elapsed() >= ttl)
            .map(|(id, _)| *id)
            .collect();
        expired
            .into_iter()
            .filter_map(|id| self.remove(id))
            .collect()
    }
}
