//! Build script for rproxy-proto
//!
//! Generates the `rproxy.v1.ControlService` client and server described by
//! `proto/rproxy/v1/control.proto`. The messages are prost derives in
//! `src/lib.rs`, so the build does not need `protoc`.

use tonic_build::manual::{Builder, Method, Service};

const CODEC: &str = "tonic_prost::ProstCodec";

fn main() {
    println!("cargo:rerun-if-changed=../../proto/rproxy/v1/control.proto");

    let method = |name: &str, route: &str, input: &str, output: &str| {
        Method::builder()
            .name(name)
            .route_name(route)
            .input_type(input)
            .output_type(output)
            .codec_path(CODEC)
    };

    let control = Service::builder()
        .name("ControlService")
        .package("rproxy.v1")
        .method(
            method(
                "open_session",
                "OpenSession",
                "crate::v1::Empty",
                "crate::v1::SessionInfo",
            )
            .build(),
        )
        .method(
            method(
                "close_session",
                "CloseSession",
                "crate::v1::Empty",
                "crate::v1::Empty",
            )
            .build(),
        )
        .method(
            method(
                "push_create_requests",
                "PushCreateRequests",
                "crate::v1::Empty",
                "crate::v1::CreateRequest",
            )
            .server_streaming()
            .build(),
        )
        .method(
            method(
                "push_reports",
                "PushReports",
                "crate::v1::Report",
                "crate::v1::Empty",
            )
            .client_streaming()
            .build(),
        )
        .build();

    Builder::new().compile(&[control]);
}
