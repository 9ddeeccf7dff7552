// SPDX-License-Identifier: Apache-2.0

use crate::bounded_channel::{BoundedReceiver, BoundedSender, TrySendError, bounded};
use crate::exporters::Sink;
use crate::topology::batch::{BufferPolicy, BufferPolicyError, PendingBatch};
use crate::topology::payload::{Batch, TelemetryRecord};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::select;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

// Deadline used when time based flushing is disabled, the timer branch is never polled.
const IDLE_TIMER: Duration = Duration::from_secs(86_400);

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AcceptError {
    /// The buffer already holds `capacity` records that are waiting to be batched.
    #[error("span buffer is at capacity")]
    Capacity,

    #[error("span buffer has shut down")]
    Closed,
}

#[derive(Debug, Clone, Copy)]
enum FlushReason {
    Count,
    Timer,
    Requested,
    Shutdown,
}

/// Cloneable producer side of a [`SpanBuffer`], handed to receiver endpoints.
#[derive(Clone)]
pub struct BufferHandle {
    tx: BoundedSender<TelemetryRecord>,
    flush_tx: mpsc::Sender<oneshot::Sender<usize>>,
}

impl BufferHandle {
    /// Enqueues a record without waiting.
    pub fn accept(&self, record: TelemetryRecord) -> Result<(), AcceptError> {
        match self.tx.try_send(record) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(AcceptError::Capacity),
            Err(TrySendError::Disconnected(_)) => Err(AcceptError::Closed),
        }
    }

    /// Forwards every record accepted so far, resolving with the number forwarded.
    pub async fn flush(&self) -> Result<usize, AcceptError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.flush_tx
            .send(ack_tx)
            .await
            .map_err(|_| AcceptError::Closed)?;
        ack_rx.await.map_err(|_| AcceptError::Closed)
    }
}

/// Accumulates records from one receiver endpoint and forwards them downstream in
/// batches, on whichever of the period or count thresholds is reached first.
///
/// A single task owns the in-progress batch, so each accepted record is forwarded in
/// exactly one batch and batches reach the sink in the order they were produced.
pub struct SpanBuffer {
    name: String,
    handle: BufferHandle,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SpanBuffer {
    pub fn start(
        name: impl Into<String>,
        policy: BufferPolicy,
        sink: Arc<dyn Sink>,
    ) -> Result<Self, BufferPolicyError> {
        policy.validate()?;

        let name = name.into();
        let (tx, rx) = bounded(policy.capacity);
        let (flush_tx, flush_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();

        let task = BufferTask {
            name: name.clone(),
            policy,
            rx,
            flush_rx,
            sink,
            cancel: cancel.clone(),
        };
        let jh = tokio::spawn(task.run());

        Ok(Self {
            name,
            handle: BufferHandle { tx, flush_tx },
            cancel,
            task: Mutex::new(Some(jh)),
        })
    }

    pub fn handle(&self) -> BufferHandle {
        self.handle.clone()
    }

    pub fn accept(&self, record: TelemetryRecord) -> Result<(), AcceptError> {
        self.handle.accept(record)
    }

    pub async fn flush(&self) -> Result<usize, AcceptError> {
        self.handle.flush().await
    }

    /// Stops the buffer after forwarding every queued record. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        let jh = self.task.lock().ok().and_then(|mut t| t.take());
        if let Some(jh) = jh {
            if let Err(e) = jh.await {
                error!(buffer = %self.name, error = ?e, "Span buffer task failed.");
            }
        }
    }
}

struct BufferTask {
    name: String,
    policy: BufferPolicy,
    rx: BoundedReceiver<TelemetryRecord>,
    flush_rx: mpsc::Receiver<oneshot::Sender<usize>>,
    sink: Arc<dyn Sink>,
    cancel: CancellationToken,
}

impl BufferTask {
    async fn run(mut self) {
        let mut pending = PendingBatch::new(self.policy.count);
        let timer_enabled = self.policy.timer_enabled();
        let timer = sleep_until(self.next_deadline());
        tokio::pin!(timer);

        loop {
            select! {
                biased;

                _ = self.cancel.cancelled() => {
                    debug!(buffer = %self.name, "Span buffer received shutdown signal, draining.");
                    self.drain_queued(&mut pending).await;
                    self.forward(pending.take_batch(), FlushReason::Shutdown).await;
                    return;
                },

                Some(ack) = self.flush_rx.recv() => {
                    let mut flushed = self.drain_queued(&mut pending).await;
                    flushed += self.forward(pending.take_batch(), FlushReason::Requested).await;
                    timer.as_mut().reset(self.next_deadline());
                    let _ = ack.send(flushed);
                },

                _ = &mut timer, if timer_enabled => {
                    self.forward(pending.take_batch(), FlushReason::Timer).await;
                    timer.as_mut().reset(self.next_deadline());
                },

                item = self.rx.next() => {
                    let Some(record) = item else {
                        debug!(buffer = %self.name, "Span buffer inputs have closed, flushing and exiting.");
                        self.forward(pending.take_batch(), FlushReason::Shutdown).await;
                        return;
                    };

                    if let Some(full) = pending.offer(record) {
                        self.forward(full, FlushReason::Count).await;
                        timer.as_mut().reset(self.next_deadline());
                    }
                },
            }
        }
    }

    fn next_deadline(&self) -> Instant {
        if self.policy.timer_enabled() {
            Instant::now() + self.policy.period
        } else {
            Instant::now() + IDLE_TIMER
        }
    }

    // Moves records that are already queued into the batch. Bounded by the queue length
    // at entry so that a busy producer can not stall shutdown.
    async fn drain_queued(&mut self, pending: &mut PendingBatch) -> usize {
        let mut forwarded = 0;
        for _ in 0..self.rx.len() {
            let Some(record) = self.rx.try_recv() else {
                break;
            };
            if let Some(full) = pending.offer(record) {
                forwarded += self.forward(full, FlushReason::Count).await;
            }
        }
        forwarded
    }

    async fn forward(&self, records: Vec<TelemetryRecord>, reason: FlushReason) -> usize {
        if records.is_empty() {
            return 0;
        }

        let count = records.len();
        debug!(buffer = %self.name, batch_size = count, ?reason, "Flushing span buffer.");
        if let Err(e) = self.sink.export(Batch::from(records)).await {
            warn!(buffer = %self.name, sink = self.sink.name(), error = %e, "Failed to forward batch.");
        }
        count
    }
}
