//! rproxy Core Library
//!
//! Shared functionality for the reflector and the worker:
//! - Tunnel splicing between two byte-stream legs
//! - Settings file loading
//! - Tracing initialisation
//! - Common error types

pub mod config;
pub mod error;
pub mod tracing_init;
pub mod tunnel;

pub use config::Config;
pub use error::{Error, Result};
pub use tunnel::{AlreadyPaired, Leg, SpliceSummary, Tunnel, TunnelState};
