//! gRPC server implementation for the rproxy reflector.

pub mod control_svc;
pub mod grpc_util;


pub use control_svc::ControlServiceImpl;
