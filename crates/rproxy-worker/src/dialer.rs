//! Outbound dials for the two legs of a tunnel.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::config::WorkerConfig;
use crate::error::WorkerError;

/// Opens the reflector-facing and backend-facing legs of a tunnel.
#[derive(Debug, Clone)]
pub struct LegDialer {
    reflector_data_addr: String,
    backend_addr: String,
    dial_timeout: Duration,
}

/// Both legs of one tunnel, freshly dialed.
#[derive(Debug)]
pub struct Legs {
    pub reflector: TcpStream,
    pub backend: TcpStream,
}

impl LegDialer {
    pub fn new(config: &WorkerConfig) -> Self {
        Self {
            reflector_data_addr: config.reflector_data_addr.clone(),
            backend_addr: config.backend_addr.clone(),
            dial_timeout: config.dial_timeout,
        }
    }

    /// Dial the backend, then the reflector. The backend goes first so that a
    /// dead backend never leaves an orphan connection on the reflector.
    pub async fn open_legs(&self) -> Result<Legs, WorkerError> {
        let backend = self.dial(&self.backend_addr).await?;
        let reflector = self.dial(&self.reflector_data_addr).await?;
        Ok(Legs { reflector, backend })
    }

    async fn dial(&self, addr: &str) -> Result<TcpStream, WorkerError> {
        let stream = timeout(self.dial_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| WorkerError::DialTimeout {
                addr: addr.to_string(),
            })?
            .map_err(|source| WorkerError::Dial {
                addr: addr.to_string(),
                source,
            })?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(addr, error = %e, "Could not disable Nagle");
        }
        Ok(stream)
    }
}
