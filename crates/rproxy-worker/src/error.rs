//! Worker error types.

/// Errors that can occur in the worker.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Failed to dial {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Timed out dialing {addr}")]
    DialTimeout { addr: String },
}
