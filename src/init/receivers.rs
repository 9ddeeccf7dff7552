// SPDX-License-Identifier: Apache-2.0

use crate::exporters::Sink;
use crate::init::config::{EndpointConfig, InteractionConfig};
use crate::listener::{BindError, Listener};
use crate::receivers::agent_grpc::AgentGrpcServer;
use crate::receivers::agent_output::{AgentOutput, ReceiverCounters};
use crate::receivers::interaction_http::InteractionHttpServer;
use crate::receivers::{Endpoint, EndpointError, ServerHandle};
use crate::telemetry::Telemetry;
use crate::topology::span_buffer::SpanBuffer;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

async fn bind(address: SocketAddr) -> Result<(Listener, SocketAddr), BindError> {
    let listener = Listener::listen(address).await?;
    let bound = listener
        .bound_address()
        .map_err(|source| BindError { address, source })?;
    Ok((listener, bound))
}

/// Binds the trace listener and starts serving the OpenCensus trace service.
pub async fn start_trace_endpoint(
    config: &EndpointConfig,
    sink: Arc<dyn Sink>,
    telemetry: &Telemetry,
) -> Result<Endpoint, EndpointError> {
    let (listener, addr) = bind(config.address).await?;

    let buffer = SpanBuffer::start("trace", config.policy.clone(), sink)?;
    let output = AgentOutput::new(buffer.handle(), ReceiverCounters::for_spans(telemetry));

    let srv = AgentGrpcServer::builder()
        .with_traces_output(Some(output))
        .with_max_recv_msg_size_mib(config.max_recv_msg_size_mib)
        .build();

    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let server = ServerHandle::spawn("grpc", addr, cancel, async move {
        srv.serve(listener, token).await
    });

    info!(grpc_endpoint = addr.to_string(), "Trace endpoint listening.");

    let mut endpoint = Endpoint::new("trace").with_buffer(buffer);
    endpoint.add_server(server);
    Ok(endpoint)
}

/// Binds both interaction listeners, which share a single span buffer.
pub async fn start_interaction_endpoint(
    config: &InteractionConfig,
    sink: Arc<dyn Sink>,
    telemetry: &Telemetry,
) -> Result<Endpoint, EndpointError> {
    let (grpc_listener, grpc_addr) = bind(config.grpc.address).await?;
    let (http_listener, http_addr) = bind(config.http_address).await?;

    let buffer = SpanBuffer::start("interaction", config.grpc.policy.clone(), sink)?;
    let output = AgentOutput::new(
        buffer.handle(),
        ReceiverCounters::for_interactions(telemetry),
    );

    let grpc_srv = AgentGrpcServer::builder()
        .with_interactions_output(Some(output.clone()))
        .with_max_recv_msg_size_mib(config.grpc.max_recv_msg_size_mib)
        .build();
    let http_srv = InteractionHttpServer::builder(output)
        .with_path(config.http_path.clone())
        .build();

    let mut endpoint = Endpoint::new("interaction").with_buffer(buffer);

    let cancel = CancellationToken::new();
    let token = cancel.clone();
    endpoint.add_server(ServerHandle::spawn("grpc", grpc_addr, cancel, async move {
        grpc_srv.serve(grpc_listener, token).await
    }));

    let cancel = CancellationToken::new();
    let token = cancel.clone();
    endpoint.add_server(ServerHandle::spawn("http", http_addr, cancel, async move {
        http_srv.serve(http_listener, token).await
    }));

    info!(
        grpc_endpoint = grpc_addr.to_string(),
        http_endpoint = http_addr.to_string(),
        http_path = %config.http_path,
        "Interaction endpoint listening."
    );

    Ok(endpoint)
}
