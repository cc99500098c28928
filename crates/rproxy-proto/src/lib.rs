//! rproxy Protocol Buffers
//!
//! Message types and generated gRPC code for the reflector/worker control
//! channel.
//!
//! This crate contains:
//! - `ControlService` server and client (`rproxy.v1.ControlService`)
//! - the four messages exchanged over it

#![allow(clippy::derive_partial_eq_without_eq)]

/// rproxy v1 API definitions.
pub mod v1 {
    /// Request/response placeholder for RPCs that carry no data.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, ::prost::Message)]
    pub struct Empty {}

    /// Returned by `OpenSession`: the epoch of the session just opened.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, ::prost::Message)]
    pub struct SessionInfo {
        #[prost(uint64, tag = "1")]
        pub epoch: u64,
    }

    /// Reflector asks the worker to open the legs of tunnel `id`.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, ::prost::Message)]
    pub struct CreateRequest {
        #[prost(uint32, tag = "1")]
        pub id: u32,
        #[prost(uint64, tag = "2")]
        pub epoch: u64,
    }

    /// Worker tells the reflector which local port its reflector-facing leg
    /// for tunnel `id` was dialed from, or that it could not open the legs.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, ::prost::Message)]
    pub struct Report {
        #[prost(uint32, tag = "1")]
        pub id: u32,
        #[prost(uint32, tag = "2")]
        pub port: u32,
        #[prost(uint64, tag = "3")]
        pub epoch: u64,
        #[prost(bool, tag = "4")]
        pub failed: bool,
    }

    include!(concat!(env!("OUT_DIR"), "/rproxy.v1.ControlService.rs"));
}

pub use v1::*;
