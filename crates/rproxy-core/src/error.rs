//! Error types for the rproxy core library.

use thiserror::Error;

use crate::tunnel::TunnelState;

/// Result type alias using the core [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for rproxy operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A tunnel was asked to splice before both legs were set
    #[error("Tunnel {id} is not ready to run (state: {state:?})")]
    TunnelNotReady { id: u32, state: TunnelState },

    /// Settings file is not valid JSON
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Settings file could not be read
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
