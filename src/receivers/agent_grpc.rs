// SPDX-License-Identifier: Apache-2.0

use crate::listener::Listener;
use crate::receivers::agent_output::{AgentOutput, AgentRequest, StreamState};
use ocagent_proto::agent::interaction::v1::interaction_service_server::{
    InteractionService, InteractionServiceServer,
};
use ocagent_proto::agent::interaction::v1::{
    ExportInteractionServiceRequest, ExportInteractionServiceResponse,
};
use ocagent_proto::agent::trace::v1::trace_service_server::{TraceService, TraceServiceServer};
use ocagent_proto::agent::trace::v1::{ExportTraceServiceRequest, ExportTraceServiceResponse};
use std::default::Default;
use tokio::select;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic::transport::server::Router;
use tonic::{Request, Response, Status, Streaming, codec::CompressionEncoding};
use tower::BoxError;
use tracing::debug;

#[derive(Default)]
pub struct AgentGrpcServerBuilder {
    max_recv_msg_size_mib: Option<usize>,
    traces_output: Option<AgentOutput>,
    interactions_output: Option<AgentOutput>,
}

impl AgentGrpcServerBuilder {
    pub fn with_max_recv_msg_size_mib(mut self, max_recv_msg_size_mib: usize) -> Self {
        self.max_recv_msg_size_mib = Some(max_recv_msg_size_mib);
        self
    }

    pub fn with_traces_output(mut self, output: Option<AgentOutput>) -> Self {
        self.traces_output = output;
        self
    }

    pub fn with_interactions_output(mut self, output: Option<AgentOutput>) -> Self {
        self.interactions_output = output;
        self
    }

    pub fn build(self) -> AgentGrpcServer {
        AgentGrpcServer {
            traces_output: self.traces_output,
            interactions_output: self.interactions_output,
            max_recv_msg_size_mib: self.max_recv_msg_size_mib,
        }
    }
}

/// Serves the OpenCensus agent streaming services. Each `Export` stream is consumed on
/// its own task; the response stream stays open, and empty, until the client half-closes.
pub struct AgentGrpcServer {
    traces_output: Option<AgentOutput>,
    interactions_output: Option<AgentOutput>,
    max_recv_msg_size_mib: Option<usize>,
}

impl AgentGrpcServer {
    pub fn builder() -> AgentGrpcServerBuilder {
        Default::default()
    }

    pub async fn serve(
        &self,
        listener: Listener,
        cancellation: CancellationToken,
    ) -> Result<(), BoxError> {
        let stream = listener.into_stream();
        let max_decoding_size = self.max_recv_msg_size_mib.map(|mib| mib * 1024 * 1024);

        let mut builder = Server::builder();
        let mut router: Option<Router> = None;

        if let Some(output) = &self.traces_output {
            let mut trace_svc = TraceServiceServer::new(AgentTraceService {
                output: output.clone(),
                cancel: cancellation.clone(),
            })
            .accept_compressed(CompressionEncoding::Gzip)
            .send_compressed(CompressionEncoding::Gzip);
            if let Some(size) = max_decoding_size {
                trace_svc = trace_svc.max_decoding_message_size(size);
            }
            router = Some(builder.add_service(trace_svc));
        }

        if let Some(output) = &self.interactions_output {
            let mut interaction_svc = InteractionServiceServer::new(AgentInteractionService {
                output: output.clone(),
                cancel: cancellation.clone(),
            })
            .accept_compressed(CompressionEncoding::Gzip)
            .send_compressed(CompressionEncoding::Gzip);
            if let Some(size) = max_decoding_size {
                interaction_svc = interaction_svc.max_decoding_message_size(size);
            }
            router = Some(match router {
                Some(router) => router.add_service(interaction_svc),
                None => builder.add_service(interaction_svc),
            });
        }

        match router {
            None => Err("no services configured for the agent gRPC receiver".into()),
            Some(router) => {
                router
                    .serve_with_incoming_shutdown(stream, async move {
                        cancellation.cancelled().await
                    })
                    .await?;
                Ok(())
            }
        }
    }
}

#[derive(Clone)]
struct AgentTraceService {
    output: AgentOutput,
    cancel: CancellationToken,
}

#[derive(Clone)]
struct AgentInteractionService {
    output: AgentOutput,
    cancel: CancellationToken,
}

#[tonic::async_trait]
impl TraceService for AgentTraceService {
    type ExportStream = ReceiverStream<Result<ExportTraceServiceResponse, Status>>;

    async fn export(
        &self,
        request: Request<Streaming<ExportTraceServiceRequest>>,
    ) -> Result<Response<Self::ExportStream>, Status> {
        let (resp_tx, resp_rx) = mpsc::channel(1);
        tokio::spawn(consume_stream(
            request.into_inner(),
            self.output.clone(),
            self.cancel.clone(),
            resp_tx,
        ));
        Ok(Response::new(ReceiverStream::new(resp_rx)))
    }
}

#[tonic::async_trait]
impl InteractionService for AgentInteractionService {
    type ExportStream = ReceiverStream<Result<ExportInteractionServiceResponse, Status>>;

    async fn export(
        &self,
        request: Request<Streaming<ExportInteractionServiceRequest>>,
    ) -> Result<Response<Self::ExportStream>, Status> {
        let (resp_tx, resp_rx) = mpsc::channel(1);
        tokio::spawn(consume_stream(
            request.into_inner(),
            self.output.clone(),
            self.cancel.clone(),
            resp_tx,
        ));
        Ok(Response::new(ReceiverStream::new(resp_rx)))
    }
}

// Holding `_responses` keeps the response stream open until the inbound half ends.
async fn consume_stream<R, Resp>(
    mut inbound: Streaming<R>,
    output: AgentOutput,
    cancel: CancellationToken,
    _responses: mpsc::Sender<Result<Resp, Status>>,
) where
    R: AgentRequest + Send + 'static,
{
    let mut state = StreamState::stream();
    loop {
        let msg = select! {
            biased;

            _ = cancel.cancelled() => break,
            msg = inbound.message() => msg,
        };

        match msg {
            Ok(Some(request)) => {
                output.ingest(&mut state, request, "grpc");
            }
            Ok(None) => break,
            Err(status) => {
                debug!(error = %status, "Export stream ended with error.");
                break;
            }
        }
    }
}
