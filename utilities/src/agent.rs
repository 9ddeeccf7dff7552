use chrono::Utc;
use ocagent_proto::agent::common::v1::{Node, ProcessIdentifier, ServiceInfo};
use ocagent_proto::agent::interaction::v1::{ExportInteractionServiceRequest, Interaction};
use ocagent_proto::agent::trace::v1::ExportTraceServiceRequest;
use ocagent_proto::resource::v1::Resource;
use ocagent_proto::trace::v1::attribute_value::Value;
use ocagent_proto::trace::v1::span::SpanKind;
use ocagent_proto::trace::v1::{AttributeValue, Attributes, Span, Status, TruncatableString};
use prost_types::Timestamp;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Generators for OpenCensus agent requests used by tests.
pub struct FakeAgent;

impl FakeAgent {
    pub fn node(service_name: &str) -> Node {
        Node {
            identifier: Some(ProcessIdentifier {
                host_name: "ip-10-250-64-50.ec2.internal".to_string(),
                pid: 4242,
                start_timestamp: Some(now()),
            }),
            library_info: None,
            service_info: Some(ServiceInfo {
                name: service_name.to_string(),
            }),
            attributes: [("deployment".to_string(), "canary".to_string())].into(),
        }
    }

    pub fn resource() -> Resource {
        Resource {
            r#type: "k8s.io/container".to_string(),
            labels: [
                ("k8s.pod.name".to_string(), "frontend-7d9f".to_string()),
                ("container.name".to_string(), "frontend".to_string()),
            ]
            .into(),
        }
    }

    /// First message of a stream: carries node and resource.
    pub fn trace_service_request() -> ExportTraceServiceRequest {
        Self::trace_service_request_with_spans(1)
    }

    pub fn trace_service_request_with_spans(num_spans: usize) -> ExportTraceServiceRequest {
        ExportTraceServiceRequest {
            node: Some(Self::node("test-service")),
            spans: Self::spans(num_spans),
            resource: Some(Self::resource()),
        }
    }

    /// Follow-up message of a stream that relies on the node sent earlier.
    pub fn trace_service_request_without_node(num_spans: usize) -> ExportTraceServiceRequest {
        ExportTraceServiceRequest {
            node: None,
            spans: Self::spans(num_spans),
            resource: None,
        }
    }

    pub fn spans(num_spans: usize) -> Vec<Span> {
        (0..num_spans).map(|i| Self::span(&format!("GET /api/{}", i))).collect()
    }

    pub fn span(name: &str) -> Span {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let start = Utc::now();
        let end = start + chrono::Duration::milliseconds(15);

        let mut attributes = Attributes::default();
        attributes.attribute_map.insert(
            "http.method".to_string(),
            AttributeValue {
                value: Some(Value::StringValue(TruncatableString::from("GET"))),
            },
        );
        attributes.attribute_map.insert(
            "http.status_code".to_string(),
            AttributeValue {
                value: Some(Value::IntValue(200)),
            },
        );

        Span {
            trace_id: trace_id(id),
            span_id: span_id(id),
            parent_span_id: vec![],
            name: Some(TruncatableString::from(name)),
            start_time: Some(timestamp(start)),
            end_time: Some(timestamp(end)),
            attributes: Some(attributes),
            status: Some(Status {
                code: 0,
                message: "".to_string(),
            }),
            kind: SpanKind::Server as i32,
            resource: None,
        }
    }

    pub fn interaction_service_request_with_interactions(
        num_interactions: usize,
    ) -> ExportInteractionServiceRequest {
        ExportInteractionServiceRequest {
            node: Some(Self::node("test-web-client")),
            interactions: (0..num_interactions)
                .map(|i| Self::interaction(&format!("click #button-{}", i)))
                .collect(),
            resource: None,
        }
    }

    pub fn interaction(name: &str) -> Interaction {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let mut attributes = Attributes::default();
        attributes.attribute_map.insert(
            "page.url".to_string(),
            AttributeValue {
                value: Some(Value::StringValue(TruncatableString::from("/checkout"))),
            },
        );

        Interaction {
            trace_id: trace_id(id),
            span_id: span_id(id),
            name: Some(TruncatableString::from(name)),
            time: Some(now()),
            attributes: Some(attributes),
        }
    }
}

fn trace_id(id: u64) -> Vec<u8> {
    let mut buf = vec![0xab; 8];
    buf.extend_from_slice(&id.to_be_bytes());
    buf
}

fn span_id(id: u64) -> Vec<u8> {
    id.to_be_bytes().to_vec()
}

fn now() -> Timestamp {
    timestamp(Utc::now())
}

fn timestamp(t: chrono::DateTime<Utc>) -> Timestamp {
    Timestamp {
        seconds: t.timestamp(),
        nanos: t.timestamp_subsec_nanos() as i32,
    }
}
