//! Reflector error types.

use tonic::Status;

/// Errors that can occur in the reflector.
#[derive(Debug, thiserror::Error)]
pub enum ReflectorError {
    #[error("No active worker session")]
    NoSession,
}

impl From<ReflectorError> for Status {
    fn from(err: ReflectorError) -> Self {
        match err {
            ReflectorError::NoSession => Self::failed_precondition(err.to_string()),
        }
    }
}
