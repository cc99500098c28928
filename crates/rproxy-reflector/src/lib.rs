//! rproxy Reflector Library
//!
//! The publicly reachable half of rproxy:
//! - Session tracking for the single active worker
//! - Pending tunnels keyed by id and pending worker data connections keyed
//!   by remote port
//! - Accept loops for clients and worker data connections
//! - Report handling that pairs the two and starts the splice
//! - gRPC `ControlService` implementation

pub mod config;
pub mod error;
pub mod pending;
pub mod queue;
pub mod reflector;
pub mod server;
pub mod session;
pub mod tunnels;

pub use config::ReflectorConfig;
pub use error::ReflectorError;
pub use reflector::{Reflector, ReflectorStats, ReportOutcome};
pub use session::Session;
