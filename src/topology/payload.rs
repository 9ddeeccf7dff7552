// SPDX-License-Identifier: Apache-2.0

use ocagent_proto::agent::common::v1::Node;
use ocagent_proto::agent::interaction::v1::Interaction;
use ocagent_proto::resource::v1::Resource;
use ocagent_proto::trace::v1::Span;
use std::slice::Iter;
use std::sync::Arc;

/// Node and resource a record arrived with. Shared by every record decoded from the
/// same message, and across messages of a stream that did not resend them.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Origin {
    pub node: Option<Node>,
    pub resource: Option<Resource>,
}

impl Origin {
    pub fn service_name(&self) -> Option<&str> {
        self.node
            .as_ref()
            .and_then(|n| n.service_info.as_ref())
            .map(|s| s.name.as_str())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum RecordData {
    Span(Span),
    Interaction(Interaction),
}

/// A single span or interaction event. Immutable once built.
#[derive(Clone, Debug, PartialEq)]
pub struct TelemetryRecord {
    origin: Arc<Origin>,
    data: RecordData,
}

impl TelemetryRecord {
    pub fn span(origin: Arc<Origin>, span: Span) -> Self {
        Self {
            origin,
            data: RecordData::Span(span),
        }
    }

    pub fn interaction(origin: Arc<Origin>, interaction: Interaction) -> Self {
        Self {
            origin,
            data: RecordData::Interaction(interaction),
        }
    }

    pub fn origin(&self) -> &Arc<Origin> {
        &self.origin
    }

    pub fn data(&self) -> &RecordData {
        &self.data
    }

    pub fn name(&self) -> &str {
        let name = match &self.data {
            RecordData::Span(s) => s.name.as_ref(),
            RecordData::Interaction(i) => i.name.as_ref(),
        };
        name.map(|n| n.value.as_str()).unwrap_or_default()
    }
}

/// Ordered, immutable group of records produced by one flush of a span buffer.
/// Cloning is cheap, so every exporter of a fan-out receives the same batch.
#[derive(Clone, Debug)]
pub struct Batch {
    records: Arc<[TelemetryRecord]>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[TelemetryRecord] {
        &self.records
    }

    pub fn iter(&self) -> Iter<'_, TelemetryRecord> {
        self.records.iter()
    }

    pub fn span_count(&self) -> usize {
        self.iter()
            .filter(|r| matches!(r.data(), RecordData::Span(_)))
            .count()
    }

    pub fn interaction_count(&self) -> usize {
        self.len() - self.span_count()
    }

    /// True when both handles point at the same underlying records.
    pub fn ptr_eq(&self, other: &Batch) -> bool {
        Arc::ptr_eq(&self.records, &other.records)
    }
}

impl From<Vec<TelemetryRecord>> for Batch {
    fn from(records: Vec<TelemetryRecord>) -> Self {
        Self {
            records: records.into(),
        }
    }
}

impl<'a> IntoIterator for &'a Batch {
    type Item = &'a TelemetryRecord;
    type IntoIter = Iter<'a, TelemetryRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
