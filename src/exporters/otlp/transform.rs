// SPDX-License-Identifier: Apache-2.0

//! Conversion of OpenCensus records into OTLP trace payloads.

use crate::topology::payload::{Batch, Origin, RecordData};
use ocagent_proto::agent::interaction::v1::Interaction;
use ocagent_proto::trace::v1::attribute_value::Value as OcValue;
use ocagent_proto::trace::v1::span::SpanKind as OcSpanKind;
use ocagent_proto::trace::v1::{Attributes, Span as OcSpan, TruncatableString};
use opentelemetry_proto::tonic::common::v1::any_value::Value;
use opentelemetry_proto::tonic::common::v1::{AnyValue, InstrumentationScope, KeyValue};
use opentelemetry_proto::tonic::resource::v1::Resource;
use opentelemetry_proto::tonic::trace::v1::span::SpanKind;
use opentelemetry_proto::tonic::trace::v1::status::StatusCode;
use opentelemetry_proto::tonic::trace::v1::{ResourceSpans, ScopeSpans, Span, Status};
use prost_types::Timestamp;
use std::sync::Arc;

pub const RECORD_TYPE_ATTR: &str = "ocagent.record_type";
pub const RESOURCE_TYPE_ATTR: &str = "opencensus.resourcetype";

const SCOPE_NAME: &str = "ocagent";

/// Groups the records of a batch by origin. Consecutive records that share an origin
/// end up in the same `ResourceSpans`, so a batch from a single stream maps to one entry.
pub fn batch_to_resource_spans(batch: &Batch) -> Vec<ResourceSpans> {
    let mut out: Vec<ResourceSpans> = Vec::new();
    let mut current: Option<&Arc<Origin>> = None;

    for record in batch {
        let span = match record.data() {
            RecordData::Span(span) => convert_span(span),
            RecordData::Interaction(interaction) => convert_interaction(interaction),
        };

        if current.is_some_and(|c| Arc::ptr_eq(c, record.origin())) {
            if let Some(scope_spans) = out.last_mut().and_then(|rs| rs.scope_spans.last_mut()) {
                scope_spans.spans.push(span);
                continue;
            }
        }

        current = Some(record.origin());
        out.push(ResourceSpans {
            resource: Some(convert_origin(record.origin())),
            scope_spans: vec![ScopeSpans {
                scope: Some(InstrumentationScope {
                    name: SCOPE_NAME.to_string(),
                    version: env!("CARGO_PKG_VERSION").to_string(),
                    ..Default::default()
                }),
                spans: vec![span],
                ..Default::default()
            }],
            ..Default::default()
        });
    }

    out
}

fn convert_origin(origin: &Origin) -> Resource {
    let mut attributes = Vec::new();

    if let Some(node) = &origin.node {
        if let Some(service) = &node.service_info {
            attributes.push(string_kv("service.name", &service.name));
        }
        if let Some(id) = &node.identifier {
            if !id.host_name.is_empty() {
                attributes.push(string_kv("host.name", &id.host_name));
            }
            if id.pid != 0 {
                attributes.push(KeyValue {
                    key: "process.pid".to_string(),
                    value: Some(AnyValue {
                        value: Some(Value::IntValue(id.pid as i64)),
                    }),
                });
            }
        }
        if let Some(library) = &node.library_info {
            if !library.core_library_version.is_empty() {
                attributes.push(string_kv(
                    "opencensus.library.version",
                    &library.core_library_version,
                ));
            }
        }
        attributes.extend(sorted(&node.attributes));
    }

    if let Some(resource) = &origin.resource {
        if !resource.r#type.is_empty() {
            attributes.push(string_kv(RESOURCE_TYPE_ATTR, &resource.r#type));
        }
        attributes.extend(sorted(&resource.labels));
    }

    Resource {
        attributes,
        ..Default::default()
    }
}

fn convert_span(span: &OcSpan) -> Span {
    let kind = match OcSpanKind::try_from(span.kind) {
        Ok(OcSpanKind::Server) => SpanKind::Server,
        Ok(OcSpanKind::Client) => SpanKind::Client,
        _ => SpanKind::Unspecified,
    };

    let status = span.status.as_ref().map(|s| {
        if s.code == 0 {
            Status::default()
        } else {
            Status {
                code: StatusCode::Error as i32,
                message: s.message.clone(),
            }
        }
    });

    let (attributes, dropped_attributes_count) = convert_attributes(span.attributes.as_ref());

    Span {
        trace_id: span.trace_id.clone(),
        span_id: span.span_id.clone(),
        parent_span_id: span.parent_span_id.clone(),
        name: string_value(span.name.as_ref()),
        kind: kind as i32,
        start_time_unix_nano: unix_nanos(span.start_time.as_ref()),
        end_time_unix_nano: unix_nanos(span.end_time.as_ref()),
        attributes,
        dropped_attributes_count,
        status,
        ..Default::default()
    }
}

// Interactions are point events, represented as zero length internal spans.
fn convert_interaction(interaction: &Interaction) -> Span {
    let (mut attributes, dropped_attributes_count) =
        convert_attributes(interaction.attributes.as_ref());
    attributes.push(string_kv(RECORD_TYPE_ATTR, "interaction"));

    let time = unix_nanos(interaction.time.as_ref());
    Span {
        trace_id: interaction.trace_id.clone(),
        span_id: interaction.span_id.clone(),
        name: string_value(interaction.name.as_ref()),
        kind: SpanKind::Internal as i32,
        start_time_unix_nano: time,
        end_time_unix_nano: time,
        attributes,
        dropped_attributes_count,
        ..Default::default()
    }
}

fn convert_attributes(attributes: Option<&Attributes>) -> (Vec<KeyValue>, u32) {
    let Some(attributes) = attributes else {
        return (Vec::new(), 0);
    };

    let mut kvs: Vec<KeyValue> = attributes
        .attribute_map
        .iter()
        .filter_map(|(key, value)| {
            let value = match value.value.as_ref()? {
                OcValue::StringValue(s) => Value::StringValue(s.value.clone()),
                OcValue::IntValue(i) => Value::IntValue(*i),
                OcValue::BoolValue(b) => Value::BoolValue(*b),
                OcValue::DoubleValue(d) => Value::DoubleValue(*d),
            };
            Some(KeyValue {
                key: key.clone(),
                value: Some(AnyValue { value: Some(value) }),
            })
        })
        .collect();
    kvs.sort_by(|a, b| a.key.cmp(&b.key));

    (kvs, attributes.dropped_attributes_count.max(0) as u32)
}

fn sorted(map: &std::collections::HashMap<String, String>) -> Vec<KeyValue> {
    let mut kvs: Vec<KeyValue> = map.iter().map(|(k, v)| string_kv(k, v)).collect();
    kvs.sort_by(|a, b| a.key.cmp(&b.key));
    kvs
}

fn string_kv(key: &str, value: &str) -> KeyValue {
    KeyValue {
        key: key.to_string(),
        value: Some(AnyValue {
            value: Some(Value::StringValue(value.to_string())),
        }),
    }
}

fn string_value(s: Option<&TruncatableString>) -> String {
    s.map(|s| s.value.clone()).unwrap_or_default()
}

// Timestamps before the epoch are clamped to zero
fn unix_nanos(ts: Option<&Timestamp>) -> u64 {
    let Some(ts) = ts else {
        return 0;
    };
    if ts.seconds < 0 {
        return 0;
    }
    (ts.seconds as u64)
        .saturating_mul(1_000_000_000)
        .saturating_add(ts.nanos.max(0) as u64)
}
