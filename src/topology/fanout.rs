// SPDX-License-Identifier: Apache-2.0

use crate::exporters::{ExportError, Sink};
use crate::telemetry::{AgentCounter, Counter};
use crate::topology::payload::Batch;
use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use opentelemetry::KeyValue;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

pub const DEFAULT_EXPORT_TIMEOUT: Duration = Duration::from_secs(5);

// Margin over the export timeout when waiting for deliveries that are already running
const IN_FLIGHT_SLACK: Duration = Duration::from_millis(100);

/// Presents a set of exporters as a single [`Sink`].
///
/// Each batch is delivered to every exporter concurrently. A delivery that fails, panics
/// or exceeds the export timeout is reported for that exporter only, the others still
/// receive the batch. The fan-out exclusively owns its exporters.
///
/// Closing waits for running deliveries, so no exporter is shut down while one of its
/// exports is pending. Batches dispatched after close are refused.
pub struct Fanout {
    exporters: Vec<Box<dyn Sink>>,
    export_timeout: Duration,
    closed: AtomicBool,
    // Read-held by every delivery, write-held by close
    in_flight: RwLock<()>,
    failed_batches: AgentCounter<u64>,
}

/// Builder for constructing a Fanout component.
pub struct FanoutBuilder {
    exporters: Vec<Box<dyn Sink>>,
    export_timeout: Duration,
    failed_batches: AgentCounter<u64>,
}

impl Default for FanoutBuilder {
    fn default() -> Self {
        Self {
            exporters: Vec::new(),
            export_timeout: DEFAULT_EXPORT_TIMEOUT,
            failed_batches: AgentCounter::NoOpCounter,
        }
    }
}

impl FanoutBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_exporter(mut self, exporter: Box<dyn Sink>) -> Self {
        self.exporters.push(exporter);
        self
    }

    pub fn with_export_timeout(mut self, export_timeout: Duration) -> Self {
        self.export_timeout = export_timeout;
        self
    }

    pub fn with_failed_batches_counter(mut self, counter: AgentCounter<u64>) -> Self {
        self.failed_batches = counter;
        self
    }

    pub fn build(self) -> Fanout {
        Fanout {
            exporters: self.exporters,
            export_timeout: self.export_timeout,
            closed: AtomicBool::new(false),
            in_flight: RwLock::new(()),
            failed_batches: self.failed_batches,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExportFailure {
    /// Position of the exporter in the fan-out.
    pub index: usize,
    pub exporter: String,
    pub error: ExportError,
}

/// Outcome of delivering one batch to every exporter.
#[derive(Debug, Default)]
pub struct FanoutReport {
    pub delivered: usize,
    pub failures: Vec<ExportFailure>,
}

impl FanoutReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Every exporter shutdown that failed during [`Fanout::close`].
#[derive(Debug)]
pub struct FanoutCloseError {
    pub failures: Vec<ExportFailure>,
}

impl fmt::Display for FanoutCloseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} exporter(s) failed to shut down:", self.failures.len())?;
        for failure in &self.failures {
            write!(f, " [{}: {}]", failure.exporter, failure.error)?;
        }
        Ok(())
    }
}

impl std::error::Error for FanoutCloseError {}

impl Fanout {
    pub fn builder() -> FanoutBuilder {
        FanoutBuilder::new()
    }

    pub fn len(&self) -> usize {
        self.exporters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exporters.is_empty()
    }

    pub async fn dispatch(&self, batch: Batch) -> FanoutReport {
        let _in_flight = self.in_flight.read().await;
        if self.closed.load(Ordering::SeqCst) {
            warn!(records = batch.len(), "Fan-out is closed, refusing batch.");
            return FanoutReport {
                delivered: 0,
                failures: self
                    .exporters
                    .iter()
                    .enumerate()
                    .map(|(index, exporter)| ExportFailure {
                        index,
                        exporter: exporter.name().to_string(),
                        error: ExportError::Closed,
                    })
                    .collect(),
            };
        }

        let deliveries = self.exporters.iter().enumerate().map(|(index, exporter)| {
            let batch = batch.clone();
            let fut = AssertUnwindSafe(async move { exporter.export(batch).await });
            async move {
                let res = guarded(self.export_timeout, fut).await;
                (index, exporter.name(), res)
            }
        });

        let mut report = FanoutReport::default();
        for (index, exporter, res) in join_all(deliveries).await {
            match res {
                Ok(()) => report.delivered += 1,
                Err(error) => report.failures.push(ExportFailure {
                    index,
                    exporter: exporter.to_string(),
                    error,
                }),
            }
        }
        report
    }

    /// Time [`Self::close`] needs when a delivery is still running and every exporter
    /// uses the full `deadline` to shut down.
    pub fn close_budget(&self, deadline: Duration) -> Duration {
        self.export_timeout + deadline + IN_FLIGHT_SLACK * 2
    }

    /// Waits for running deliveries, then shuts every exporter down exactly once, each
    /// within `deadline`. Later calls return immediately.
    pub async fn close(&self, deadline: Duration) -> Result<(), FanoutCloseError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!("Fan-out already closed.");
            return Ok(());
        }

        // Deliveries are bounded by the export timeout, so this only expires if one of
        // them is stuck outside an exporter.
        let _closing = match timeout(
            self.export_timeout + IN_FLIGHT_SLACK,
            self.in_flight.write(),
        )
        .await
        {
            Ok(guard) => Some(guard),
            Err(_) => {
                warn!("Deliveries still running at close, shutting exporters down anyway.");
                None
            }
        };

        let shutdowns = self.exporters.iter().enumerate().map(|(index, exporter)| {
            let fut = AssertUnwindSafe(async move { exporter.shutdown().await });
            async move {
                let res = guarded(deadline, fut).await;
                (index, exporter.name(), res)
            }
        });

        let failures: Vec<ExportFailure> = join_all(shutdowns)
            .await
            .into_iter()
            .filter_map(|(index, exporter, res)| {
                res.err().map(|error| ExportFailure {
                    index,
                    exporter: exporter.to_string(),
                    error,
                })
            })
            .collect();

        if failures.is_empty() {
            info!(exporters = self.exporters.len(), "Exporters shut down.");
            Ok(())
        } else {
            Err(FanoutCloseError { failures })
        }
    }
}

impl Sink for Fanout {
    fn name(&self) -> &str {
        "fanout"
    }

    fn export(&self, batch: Batch) -> BoxFuture<'_, Result<(), ExportError>> {
        Box::pin(async move {
            let records = batch.len();
            let report = self.dispatch(batch).await;
            for failure in &report.failures {
                error!(
                    exporter = %failure.exporter,
                    records,
                    error = %failure.error,
                    "Exporter failed to export batch."
                );
                self.failed_batches
                    .add(1, &[KeyValue::new("exporter", failure.exporter.clone())]);
            }
            Ok(())
        })
    }

    fn shutdown(&self) -> BoxFuture<'_, Result<(), ExportError>> {
        Box::pin(async move {
            self.close(DEFAULT_EXPORT_TIMEOUT)
                .await
                .map_err(|e| ExportError::Failed(e.to_string()))
        })
    }
}

async fn guarded<F>(limit: Duration, fut: AssertUnwindSafe<F>) -> Result<(), ExportError>
where
    F: Future<Output = Result<(), ExportError>>,
{
    match timeout(limit, fut.catch_unwind()).await {
        Ok(Ok(res)) => res,
        Ok(Err(panic)) => Err(ExportError::Panicked(panic_message(panic))),
        Err(_) => Err(ExportError::Timeout(limit)),
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exporters::testing::{
        FailingSink, HangingSink, PanickingSink, RecordingSink, StallingSink,
    };
    use crate::telemetry::Telemetry;
    use crate::topology::payload::test_records::numbered;
    use std::sync::Arc;
    use tokio_test::{assert_err, assert_ok};

    fn batch() -> Batch {
        Batch::from(vec![numbered(0), numbered(1), numbered(2)])
    }

    #[tokio::test]
    async fn failing_exporter_does_not_block_others() {
        let first = RecordingSink::default();
        let third = RecordingSink::default();
        let fanout = Fanout::builder()
            .add_exporter(Box::new(first.clone()))
            .add_exporter(Box::new(FailingSink))
            .add_exporter(Box::new(third.clone()))
            .build();

        let batch = batch();
        let report = fanout.dispatch(batch.clone()).await;

        assert_eq!(2, report.delivered);
        assert_eq!(1, report.failures.len());
        assert_eq!(1, report.failures[0].index);
        assert_eq!("failing", report.failures[0].exporter);
        assert!(matches!(report.failures[0].error, ExportError::Failed(_)));

        // both survivors see the identical batch
        assert!(first.batches()[0].ptr_eq(&batch));
        assert!(third.batches()[0].ptr_eq(&batch));
    }

    #[tokio::test]
    async fn panicking_exporter_is_isolated() {
        let recording = RecordingSink::default();
        let fanout = Fanout::builder()
            .add_exporter(Box::new(PanickingSink))
            .add_exporter(Box::new(recording.clone()))
            .build();

        let report = fanout.dispatch(batch()).await;
        assert_eq!(1, report.delivered);
        assert_eq!(
            ExportError::Panicked("exporter bug".to_string()),
            report.failures[0].error
        );
        assert_eq!(1, recording.batches().len());

        // as a sink the failure is absorbed
        assert_ok!(fanout.export(batch()).await);
        assert_eq!(2, recording.batches().len());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_exporter_is_bounded() {
        let recording = RecordingSink::default();
        let fanout = Fanout::builder()
            .add_exporter(Box::new(HangingSink))
            .add_exporter(Box::new(recording.clone()))
            .with_export_timeout(Duration::from_millis(200))
            .build();

        let report = fanout.dispatch(batch()).await;
        assert_eq!(
            ExportError::Timeout(Duration::from_millis(200)),
            report.failures[0].error
        );
        assert_eq!(1, recording.batches().len());
    }

    #[tokio::test]
    async fn empty_fanout_accepts_batches() {
        let fanout = Fanout::builder().build();
        assert!(fanout.is_empty());

        let report = fanout.dispatch(batch()).await;
        assert!(report.is_success());
        assert_eq!(0, report.delivered);
        assert_ok!(fanout.close(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn close_shuts_down_each_exporter_once() {
        let first = RecordingSink::default();
        let second = RecordingSink::default();
        let fanout = Fanout::builder()
            .add_exporter(Box::new(first.clone()))
            .add_exporter(Box::new(second.clone()))
            .build();

        assert_ok!(fanout.close(Duration::from_secs(1)).await);
        assert_ok!(fanout.close(Duration::from_secs(1)).await);
        assert_ok!(fanout.shutdown().await);

        assert_eq!(1, first.shutdowns());
        assert_eq!(1, second.shutdowns());
    }

    #[tokio::test(start_paused = true)]
    async fn close_aggregates_failures() {
        let recording = RecordingSink::default();
        let fanout = Fanout::builder()
            .add_exporter(Box::new(FailingSink))
            .add_exporter(Box::new(recording.clone()))
            .add_exporter(Box::new(PanickingSink))
            .add_exporter(Box::new(HangingSink))
            .build();

        let err = assert_err!(fanout.close(Duration::from_millis(100)).await);
        let indexes: Vec<usize> = err.failures.iter().map(|f| f.index).collect();
        assert_eq!(vec![0, 2, 3], indexes);
        assert_eq!(
            ExportError::Panicked("shutdown bug".to_string()),
            err.failures[1].error
        );
        assert_eq!(
            ExportError::Timeout(Duration::from_millis(100)),
            err.failures[2].error
        );
        assert_eq!(1, recording.shutdowns());
        assert!(err.to_string().contains("3 exporter(s) failed"));
    }

    #[tokio::test]
    async fn failed_deliveries_are_counted_per_exporter() {
        let telemetry = Telemetry::new();
        let first = RecordingSink::default();
        let third = RecordingSink::default();
        let fanout = Fanout::builder()
            .add_exporter(Box::new(first.clone()))
            .add_exporter(Box::new(FailingSink))
            .add_exporter(Box::new(third.clone()))
            .with_failed_batches_counter(telemetry.u64_counter(
                "ocagent_exporter_failed_batches",
                "Number of batches an exporter failed to export",
                "batches",
            ))
            .build();

        assert_ok!(fanout.export(batch()).await);

        let failed = |exporter| {
            telemetry.counter_total("ocagent_exporter_failed_batches", &[("exporter", exporter)])
        };
        assert_eq!(1, failed("failing"));
        assert_eq!(0, failed("recording"));
        assert_eq!(1, telemetry.counter_total("ocagent_exporter_failed_batches", &[]));
        assert_eq!(1, first.batches().len());
        assert_eq!(1, third.batches().len());
    }

    #[tokio::test(start_paused = true)]
    async fn close_waits_for_running_deliveries() {
        let stalling = StallingSink::default();
        let fanout = Arc::new(
            Fanout::builder()
                .add_exporter(Box::new(stalling.clone()))
                .with_export_timeout(Duration::from_millis(300))
                .build(),
        );

        let delivery = {
            let fanout = fanout.clone();
            tokio::spawn(async move { fanout.dispatch(batch()).await })
        };
        while stalling.exports() == 0 {
            tokio::task::yield_now().await;
        }

        assert_eq!(
            Duration::from_millis(1500),
            fanout.close_budget(Duration::from_secs(1))
        );
        assert_ok!(fanout.close(Duration::from_secs(1)).await);
        assert_eq!(1, stalling.shutdowns());
        assert_eq!(0, stalling.shutdowns_while_pending());
        assert_eq!(0, stalling.pending());

        let report = delivery.await.unwrap();
        assert_eq!(
            ExportError::Timeout(Duration::from_millis(300)),
            report.failures[0].error
        );

        // nothing reaches an exporter after close
        let report = fanout.dispatch(batch()).await;
        assert_eq!(ExportError::Closed, report.failures[0].error);
        assert_eq!(1, stalling.exports());
    }
}
