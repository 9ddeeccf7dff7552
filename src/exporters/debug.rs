// SPDX-License-Identifier: Apache-2.0

use crate::exporters::{ExportError, Sink};
use crate::topology::payload::{Batch, RecordData, TelemetryRecord};
use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::{Level, event};

// Basic debug logger, future thoughts on additional configurability:
//  - configurable log level (defaults to info, but could log to debug, etc)
//  - sampling, only log at a given RPS or percentage

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    #[default]
    Basic,
    Detailed,
}

pub struct DebugExporter {
    verbosity: Verbosity,
}

impl DebugExporter {
    pub fn new(verbosity: Verbosity) -> Self {
        Self { verbosity }
    }

    fn log_basic(&self, batch: &Batch) {
        event!(
            Level::INFO,
            records = batch.len(),
            spans = batch.span_count(),
            interactions = batch.interaction_count(),
            "Received batch."
        );
    }

    fn log_detailed(&self, record: &TelemetryRecord) {
        let service = record.origin().service_name().unwrap_or("unknown");
        match record.data() {
            RecordData::Span(span) => event!(
                Level::INFO,
                data_type = "span",
                service,
                name = record.name(),
                trace_id = hex(&span.trace_id),
                span_id = hex(&span.span_id),
                kind = span.kind,
                "Span."
            ),
            RecordData::Interaction(interaction) => event!(
                Level::INFO,
                data_type = "interaction",
                service,
                name = record.name(),
                trace_id = hex(&interaction.trace_id),
                "Interaction."
            ),
        }
    }
}

impl Sink for DebugExporter {
    fn name(&self) -> &str {
        "debug"
    }

    fn export(&self, batch: Batch) -> BoxFuture<'_, Result<(), ExportError>> {
        Box::pin(async move {
            self.log_basic(&batch);
            if self.verbosity == Verbosity::Detailed {
                batch.iter().for_each(|r| self.log_detailed(r));
            }
            Ok(())
        })
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::payload::Origin;
    use std::sync::Arc;
    use tokio_test::assert_ok;
    use tracing_test::traced_test;
    use utilities::agent::FakeAgent;

    #[traced_test]
    #[tokio::test]
    async fn logs_detailed_records() {
        let origin = Arc::new(Origin {
            node: Some(FakeAgent::node("checkout")),
            resource: None,
        });
        let batch = Batch::from(vec![
            TelemetryRecord::span(origin.clone(), FakeAgent::span("GET /cart")),
            TelemetryRecord::interaction(origin, FakeAgent::interaction("click #pay")),
        ]);

        let exp = DebugExporter::new(Verbosity::Detailed);
        assert_ok!(exp.export(batch).await);

        assert!(logs_contain("Received batch."));
        assert!(logs_contain("GET /cart"));
        assert!(logs_contain("click #pay"));
        assert!(logs_contain("checkout"));
    }

    #[test]
    fn hex_encodes_ids() {
        assert_eq!("00ab10", hex(&[0x00, 0xab, 0x10]));
    }
}
