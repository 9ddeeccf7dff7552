// SPDX-License-Identifier: Apache-2.0

use crate::exporters::{ExportError, Sink};
use crate::topology::payload::Batch;
use futures::future::BoxFuture;
use tracing::debug;

/// Accepts and discards every batch.
#[derive(Default)]
pub struct BlackholeExporter;

impl BlackholeExporter {
    pub fn new() -> Self {
        BlackholeExporter
    }
}

impl Sink for BlackholeExporter {
    fn name(&self) -> &str {
        "blackhole"
    }

    fn export(&self, batch: Batch) -> BoxFuture<'_, Result<(), ExportError>> {
        Box::pin(async move {
            debug!(records = batch.len(), "dropping batch in blackhole exporter");
            Ok(())
        })
    }
}
