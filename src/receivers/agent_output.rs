// SPDX-License-Identifier: Apache-2.0

use crate::receivers::DecodeError;
use crate::telemetry::{AgentCounter, Counter, Telemetry};
use crate::topology::payload::{Origin, TelemetryRecord};
use crate::topology::span_buffer::{AcceptError, BufferHandle};
use ocagent_proto::agent::common::v1::Node;
use ocagent_proto::agent::interaction::v1::{ExportInteractionServiceRequest, Interaction};
use ocagent_proto::agent::trace::v1::ExportTraceServiceRequest;
use ocagent_proto::resource::v1::Resource;
use ocagent_proto::trace::v1::Span;
use opentelemetry::KeyValue;
use std::sync::Arc;
use tracing::{debug, warn};

const TRACE_ID_LEN: usize = 16;
const SPAN_ID_LEN: usize = 8;

/// An inbound export request: an optional node and resource plus a list of items.
pub(crate) trait AgentRequest {
    type Item;

    fn into_parts(self) -> (Option<Node>, Option<Resource>, Vec<Self::Item>);

    fn validate(item: &Self::Item) -> Result<(), DecodeError>;

    fn into_record(origin: Arc<Origin>, item: Self::Item) -> TelemetryRecord;
}

impl AgentRequest for ExportTraceServiceRequest {
    type Item = Span;

    fn into_parts(self) -> (Option<Node>, Option<Resource>, Vec<Span>) {
        (self.node, self.resource, self.spans)
    }

    fn validate(span: &Span) -> Result<(), DecodeError> {
        if span.trace_id.len() != TRACE_ID_LEN {
            return Err(DecodeError::InvalidTraceId(span.trace_id.len()));
        }
        if span.span_id.len() != SPAN_ID_LEN {
            return Err(DecodeError::InvalidSpanId(span.span_id.len()));
        }
        Ok(())
    }

    fn into_record(origin: Arc<Origin>, span: Span) -> TelemetryRecord {
        TelemetryRecord::span(origin, span)
    }
}

impl AgentRequest for ExportInteractionServiceRequest {
    type Item = Interaction;

    fn into_parts(self) -> (Option<Node>, Option<Resource>, Vec<Interaction>) {
        (self.node, self.resource, self.interactions)
    }

    // Correlation with a trace is optional for interactions
    fn validate(interaction: &Interaction) -> Result<(), DecodeError> {
        let trace_id = interaction.trace_id.len();
        if trace_id != 0 && trace_id != TRACE_ID_LEN {
            return Err(DecodeError::InvalidTraceId(trace_id));
        }
        let span_id = interaction.span_id.len();
        if span_id != 0 && span_id != SPAN_ID_LEN {
            return Err(DecodeError::InvalidSpanId(span_id));
        }
        Ok(())
    }

    fn into_record(origin: Arc<Origin>, interaction: Interaction) -> TelemetryRecord {
        TelemetryRecord::interaction(origin, interaction)
    }
}

/// Node and resource carried over between the messages of one stream.
pub(crate) struct StreamState {
    origin: Option<Arc<Origin>>,
    require_node: bool,
}

impl StreamState {
    /// Streams must identify their node in the first message, later messages inherit it.
    pub(crate) fn stream() -> Self {
        Self {
            origin: None,
            require_node: true,
        }
    }

    /// Standalone requests, such as HTTP posts, may omit the node.
    pub(crate) fn unary() -> Self {
        Self {
            origin: None,
            require_node: false,
        }
    }

    fn origin_for(
        &mut self,
        node: Option<Node>,
        resource: Option<Resource>,
    ) -> Result<Arc<Origin>, DecodeError> {
        let previous = self.origin.as_deref();
        if node.is_none() && previous.is_none_or(|p| p.node.is_none()) && self.require_node {
            return Err(DecodeError::MissingNode);
        }

        let origin = match (node, resource, &self.origin) {
            (None, None, Some(previous)) => return Ok(previous.clone()),
            (node, resource, previous) => Arc::new(Origin {
                node: node.or_else(|| previous.as_ref().and_then(|p| p.node.clone())),
                resource: resource.or_else(|| previous.as_ref().and_then(|p| p.resource.clone())),
            }),
        };
        self.origin = Some(origin.clone());
        Ok(origin)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct IngestOutcome {
    pub(crate) accepted: usize,
    pub(crate) refused: usize,
    pub(crate) dropped: usize,
}

#[derive(Clone)]
pub struct ReceiverCounters {
    accepted: AgentCounter<u64>,
    refused: AgentCounter<u64>,
    dropped: AgentCounter<u64>,
}

impl ReceiverCounters {
    pub fn noop() -> Self {
        Self {
            accepted: AgentCounter::NoOpCounter,
            refused: AgentCounter::NoOpCounter,
            dropped: AgentCounter::NoOpCounter,
        }
    }

    pub fn for_spans(telemetry: &Telemetry) -> Self {
        Self {
            accepted: telemetry.u64_counter(
                "ocagent_receiver_accepted_spans",
                "Number of spans successfully ingested and pushed into a span buffer",
                "spans",
            ),
            refused: telemetry.u64_counter(
                "ocagent_receiver_refused_spans",
                "Number of spans that could not be pushed into a span buffer",
                "spans",
            ),
            dropped: telemetry.u64_counter(
                "ocagent_receiver_dropped_spans",
                "Number of spans dropped because they could not be decoded",
                "spans",
            ),
        }
    }

    pub fn for_interactions(telemetry: &Telemetry) -> Self {
        Self {
            accepted: telemetry.u64_counter(
                "ocagent_receiver_accepted_interactions",
                "Number of interactions successfully ingested and pushed into a span buffer",
                "interactions",
            ),
            refused: telemetry.u64_counter(
                "ocagent_receiver_refused_interactions",
                "Number of interactions that could not be pushed into a span buffer",
                "interactions",
            ),
            dropped: telemetry.u64_counter(
                "ocagent_receiver_dropped_interactions",
                "Number of interactions dropped because they could not be decoded",
                "interactions",
            ),
        }
    }

    pub(crate) fn record(&self, outcome: &IngestOutcome, protocol: &'static str) {
        let tags = [KeyValue::new("protocol", protocol)];
        self.accepted.add(outcome.accepted as u64, &tags);
        self.refused.add(outcome.refused as u64, &tags);
        self.dropped.add(outcome.dropped as u64, &tags);
    }
}

/// Where a receiver pushes decoded records.
#[derive(Clone)]
pub struct AgentOutput {
    buffer: BufferHandle,
    counters: ReceiverCounters,
}

impl AgentOutput {
    pub fn new(buffer: BufferHandle, counters: ReceiverCounters) -> Self {
        Self { buffer, counters }
    }

    /// Decodes the records of one request into the buffer. Records that fail validation,
    /// or every record when the stream has no node yet, are dropped and counted.
    pub(crate) fn ingest<R: AgentRequest>(
        &self,
        state: &mut StreamState,
        request: R,
        protocol: &'static str,
    ) -> IngestOutcome {
        let (node, resource, items) = request.into_parts();
        let mut outcome = IngestOutcome::default();

        let origin = match state.origin_for(node, resource) {
            Ok(origin) => origin,
            Err(e) => {
                outcome.dropped = items.len();
                warn!(protocol, error = %e, dropped = outcome.dropped, "Dropping message.");
                self.counters.record(&outcome, protocol);
                return outcome;
            }
        };

        for item in items {
            if let Err(e) = R::validate(&item) {
                debug!(protocol, error = %e, "Dropping invalid record.");
                outcome.dropped += 1;
                continue;
            }
            match self.buffer.accept(R::into_record(origin.clone(), item)) {
                Ok(()) => outcome.accepted += 1,
                Err(AcceptError::Capacity) | Err(AcceptError::Closed) => outcome.refused += 1,
            }
        }

        if outcome.refused > 0 {
            warn!(protocol, refused = outcome.refused, "Span buffer refused records.");
        }
        self.counters.record(&outcome, protocol);
        outcome
    }
}
