// SPDX-License-Identifier: Apache-2.0

//! Sinks used by unit tests across the crate.

use crate::exporters::{ExportError, Sink};
use crate::topology::payload::Batch;
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};

#[derive(Clone, Default)]
pub(crate) struct RecordingSink {
    batches: Arc<Mutex<Vec<Batch>>>,
    shutdowns: Arc<AtomicUsize>,
}

impl RecordingSink {
    pub(crate) fn batches(&self) -> Vec<Batch> {
        self.batches.lock().unwrap().clone()
    }

    pub(crate) fn record_count(&self) -> usize {
        self.batches().iter().map(|b| b.len()).sum()
    }

    pub(crate) fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    /// Polls until at least `n` batches arrived or the timeout elapses.
    pub(crate) async fn wait_for_batches(&self, n: usize, timeout: Duration) -> Vec<Batch> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let batches = self.batches();
            if batches.len() >= n || tokio::time::Instant::now() >= deadline {
                return batches;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

impl Sink for RecordingSink {
    fn name(&self) -> &str {
        "recording"
    }

    fn export(&self, batch: Batch) -> BoxFuture<'_, Result<(), ExportError>> {
        self.batches.lock().unwrap().push(batch);
        Box::pin(futures::future::ok(()))
    }

    fn shutdown(&self) -> BoxFuture<'_, Result<(), ExportError>> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Box::pin(futures::future::ok(()))
    }
}

pub(crate) struct FailingSink;

impl Sink for FailingSink {
    fn name(&self) -> &str {
        "failing"
    }

    fn export(&self, _batch: Batch) -> BoxFuture<'_, Result<(), ExportError>> {
        Box::pin(futures::future::err(ExportError::Failed(
            "backend unavailable".to_string(),
        )))
    }

    fn shutdown(&self) -> BoxFuture<'_, Result<(), ExportError>> {
        Box::pin(futures::future::err(ExportError::Failed(
            "connection reset".to_string(),
        )))
    }
}

pub(crate) struct PanickingSink;

impl Sink for PanickingSink {
    fn name(&self) -> &str {
        "panicking"
    }

    fn export(&self, _batch: Batch) -> BoxFuture<'_, Result<(), ExportError>> {
        panic!("exporter bug")
    }

    fn shutdown(&self) -> BoxFuture<'_, Result<(), ExportError>> {
        Box::pin(futures::future::lazy(|_| -> Result<(), ExportError> {
            panic!("shutdown bug")
        }))
    }
}

/// Never completes an export or a shutdown.
pub(crate) struct HangingSink;

impl Sink for HangingSink {
    fn name(&self) -> &str {
        "hanging"
    }

    fn export(&self, _batch: Batch) -> BoxFuture<'_, Result<(), ExportError>> {
        Box::pin(futures::future::pending())
    }

    fn shutdown(&self) -> BoxFuture<'_, Result<(), ExportError>> {
        Box::pin(futures::future::pending())
    }
}

/// Signals when an export starts, then blocks until the test releases a permit.
pub(crate) struct GatedSink {
    pub(crate) inner: RecordingSink,
    entered: mpsc::UnboundedSender<()>,
    release: Arc<Semaphore>,
}

impl GatedSink {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<()>, Arc<Semaphore>) {
        let (entered, entered_rx) = mpsc::unbounded_channel();
        let release = Arc::new(Semaphore::new(0));
        let sink = Self {
            inner: RecordingSink::default(),
            entered,
            release: release.clone(),
        };
        (sink, entered_rx, release)
    }
}

impl Sink for GatedSink {
    fn name(&self) -> &str {
        "gated"
    }

    fn export(&self, batch: Batch) -> BoxFuture<'_, Result<(), ExportError>> {
        Box::pin(async move {
            let _ = self.entered.send(());
            let permit = self.release.acquire().await.unwrap();
            permit.forget();
            self.inner.export(batch).await
        })
    }
}

/// Exports never complete on their own. Tracks whether shutdown was requested while an
/// export was still pending.
#[derive(Clone, Default)]
pub(crate) struct StallingSink {
    exports: Arc<AtomicUsize>,
    pending: Arc<AtomicUsize>,
    shutdowns: Arc<AtomicUsize>,
    shutdowns_while_pending: Arc<AtomicUsize>,
}

struct PendingExport(Arc<AtomicUsize>);

impl Drop for PendingExport {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl StallingSink {
    pub(crate) fn exports(&self) -> usize {
        self.exports.load(Ordering::SeqCst)
    }

    pub(crate) fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub(crate) fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    pub(crate) fn shutdowns_while_pending(&self) -> usize {
        self.shutdowns_while_pending.load(Ordering::SeqCst)
    }
}

impl Sink for StallingSink {
    fn name(&self) -> &str {
        "stalling"
    }

    fn export(&self, _batch: Batch) -> BoxFuture<'_, Result<(), ExportError>> {
        self.exports.fetch_add(1, Ordering::SeqCst);
        self.pending.fetch_add(1, Ordering::SeqCst);
        let guard = PendingExport(self.pending.clone());
        Box::pin(async move {
            let _guard = guard;
            futures::future::pending::<Result<(), ExportError>>().await
        })
    }

    fn shutdown(&self) -> BoxFuture<'_, Result<(), ExportError>> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        if self.pending() > 0 {
            self.shutdowns_while_pending.fetch_add(1, Ordering::SeqCst);
        }
        Box::pin(futures::future::ok(()))
    }
}
