//! rproxy Worker Library
//!
//! The outbound-only half of rproxy. For every create-request from the
//! reflector it dials the local backend and the reflector's data port,
//! splices the two and reports the reflector leg's local port back.

pub mod client;
pub mod config;
pub mod dialer;
pub mod error;
pub mod handler;
pub mod tunnels;

pub use client::Worker;
pub use config::{ReconnectPolicy, WorkerConfig};
pub use error::WorkerError;
pub use handler::CreateRequestHandler;
