//! Registry of the worker's running splices.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tracing::debug;

use rproxy_core::Tunnel;

/// Running tunnels keyed by `(epoch, id)`.
#[derive(Default)]
pub struct ActiveTunnels {
    running: Arc<Mutex<HashMap<(u64, u32), AbortHandle>>>,
}

impl ActiveTunnels {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start splicing `tunnel`, which must already be paired. The entry is
    /// removed again when the splice ends.
    pub async fn spawn(&self, epoch: u64, mut tunnel: Tunnel<TcpStream>) {
        let key = (epoch, tunnel.id());
        let running = Arc::clone(&self.running);

        // Hold the lock across spawn so the task's removal cannot run before
        // the insert.
        let mut guard = self.running.lock().await;
        let handle = tokio::spawn(async move {
            let id = tunnel.id();
            match tunnel.run().await {
                Ok(summary) => debug!(
                    id,
                    epoch,
                    reflector_to_backend = summary.forward.bytes,
                    backend_to_reflector = summary.backward.bytes,
                    "Splice finished"
                ),
                Err(e) => debug!(id, epoch, error = %e, "Splice could not start"),
            }
            running.lock().await.remove(&key);
        });
        guard.insert(key, handle.abort_handle());
    }

    pub async fn len(&self) -> usize {
        self.running.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.running.lock().await.is_empty()
    }

    /// Abort every running splice, closing both legs of each.
    pub async fn abort_all(&self) -> usize {
        let drained: Vec<AbortHandle> = self.running.lock().await.drain().map(|(_, h)| h).collect();
        for handle in &drained {
            handle.abort();
        }
        drained.len()
    }
}
