// SPDX-License-Identifier: Apache-2.0

pub mod blackhole;
pub mod debug;
pub mod otlp;

#[cfg(test)]
pub(crate) mod testing;

use crate::topology::payload::Batch;
use futures::future::BoxFuture;

/// Failure reported by an exporter for one batch or during shutdown.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExportError {
    #[error("export failed: {0}")]
    Failed(String),

    #[error("export did not complete within {0:?}")]
    Timeout(std::time::Duration),

    #[error("exporter panicked: {0}")]
    Panicked(String),

    #[error("exporters have shut down")]
    Closed,
}

/// A consumer of batches. Exporters, and the fan-out that groups them, implement this.
///
/// Implementations must tolerate concurrent `export` calls from several span buffers.
pub trait Sink: Send + Sync {
    fn name(&self) -> &str;

    fn export(&self, batch: Batch) -> BoxFuture<'_, Result<(), ExportError>>;

    /// Releases exporter resources. Called exactly once, after the last export.
    fn shutdown(&self) -> BoxFuture<'_, Result<(), ExportError>> {
        Box::pin(futures::future::ok(()))
    }
}
