// SPDX-License-Identifier: Apache-2.0

use crate::exporters::otlp::transform::batch_to_resource_spans;
use crate::exporters::{ExportError, Sink};
use crate::topology::payload::Batch;
use futures::future::BoxFuture;
use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use opentelemetry_proto::tonic::collector::trace::v1::trace_service_client::TraceServiceClient;
use std::time::Duration;
use tonic::codec::CompressionEncoding;
use tonic::transport::{Channel, Endpoint};
use tower::BoxError;
use tracing::{debug, warn};

pub const DEFAULT_OTLP_TIMEOUT: Duration = Duration::from_secs(5);

/// Forwards batches, converted to OTLP spans, to an OTLP/gRPC trace collector.
///
/// The connection is established on first use and re-established by the channel
/// when it drops, so a collector that is down at startup does not fail the agent.
pub struct OtlpExporter {
    endpoint: String,
    client: TraceServiceClient<Channel>,
}

impl OtlpExporter {
    pub fn new(endpoint: &str, timeout: Duration, gzip: bool) -> Result<Self, BoxError> {
        let channel = Endpoint::from_shared(endpoint.to_string())?
            .timeout(timeout)
            .connect_timeout(timeout)
            .connect_lazy();

        let mut client = TraceServiceClient::new(channel);
        if gzip {
            client = client.send_compressed(CompressionEncoding::Gzip);
        }
        client = client.accept_compressed(CompressionEncoding::Gzip);

        Ok(Self {
            endpoint: endpoint.to_string(),
            client,
        })
    }
}

impl Sink for OtlpExporter {
    fn name(&self) -> &str {
        "otlp"
    }

    fn export(&self, batch: Batch) -> BoxFuture<'_, Result<(), ExportError>> {
        Box::pin(async move {
            let request = ExportTraceServiceRequest {
                resource_spans: batch_to_resource_spans(&batch),
            };

            let mut client = self.client.clone();
            let response = client.export(request).await.map_err(|status| {
                ExportError::Failed(format!(
                    "{}: {} ({:?})",
                    self.endpoint,
                    status.message(),
                    status.code()
                ))
            })?;

            if let Some(partial) = response.into_inner().partial_success {
                if partial.rejected_spans > 0 {
                    warn!(
                        endpoint = %self.endpoint,
                        rejected = partial.rejected_spans,
                        message = %partial.error_message,
                        "Collector rejected part of the batch."
                    );
                }
            }
            debug!(endpoint = %self.endpoint, records = batch.len(), "Exported batch.");
            Ok(())
        })
    }
}
