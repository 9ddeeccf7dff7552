use tonic_build::manual::{Builder, Method, Service};

fn main() {
    println!("cargo::rerun-if-changed=build.rs");

    let trace = Service::builder()
        .name("TraceService")
        .package("opencensus.proto.agent.trace.v1")
        .method(
            Method::builder()
                .name("export")
                .route_name("Export")
                .input_type("crate::agent::trace::v1::ExportTraceServiceRequest")
                .output_type("crate::agent::trace::v1::ExportTraceServiceResponse")
                .codec_path("tonic::codec::ProstCodec")
                .client_streaming()
                .server_streaming()
                .build(),
        )
        .build();

    let interaction = Service::builder()
        .name("InteractionService")
        .package("opencensus.proto.agent.interaction.v1")
        .method(
            Method::builder()
                .name("export")
                .route_name("Export")
                .input_type("crate::agent::interaction::v1::ExportInteractionServiceRequest")
                .output_type("crate::agent::interaction::v1::ExportInteractionServiceResponse")
                .codec_path("tonic::codec::ProstCodec")
                .client_streaming()
                .server_streaming()
                .build(),
        )
        .build();

    Builder::new().compile(&[trace, interaction]);
}
