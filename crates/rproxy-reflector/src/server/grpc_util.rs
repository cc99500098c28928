//! Shared gRPC helpers.

use tonic::{Code, Status};

/// Whether `status` is an ordinary peer disconnect (worker exit, network
/// drop) rather than a protocol failure.
///
/// The status code is checked first. The message fallback depends on
/// hyper/h2 wording and may need updating across versions.
pub fn is_peer_disconnect(status: &Status) -> bool {
    if matches!(status.code(), Code::Unavailable | Code::Cancelled) {
        return true;
    }
    let msg = status.message();
    msg.contains("h2 protocol error")
        || msg.contains("broken pipe")
        || msg.contains("connection reset")
        || msg.contains("stream no longer needed")
}
