// SPDX-License-Identifier: Apache-2.0

use futures::future::BoxFuture;
use std::time::Duration;
use tokio::time::{Instant, timeout};
use tower::BoxError;
use tracing::{debug, error, warn};

type StopFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), BoxError>> + Send>;

/// Stop functions registered while the agent starts, run in reverse order on shutdown.
#[derive(Default)]
pub struct ShutdownSweep {
    stops: Vec<Stop>,
}

struct Stop {
    name: &'static str,
    timeout: Option<Duration>,
    run: StopFn,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub stopped: usize,
    pub failed: usize,
    pub timed_out: usize,
}

impl ShutdownSweep {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: &'static str, stop: F)
    where
        F: FnOnce() -> BoxFuture<'static, Result<(), BoxError>> + Send + 'static,
    {
        self.stops.push(Stop {
            name,
            timeout: None,
            run: Box::new(stop),
        });
    }

    /// Registers a stop with its own bound instead of the one passed to [`Self::run`].
    pub fn register_with_timeout<F>(&mut self, name: &'static str, timeout: Duration, stop: F)
    where
        F: FnOnce() -> BoxFuture<'static, Result<(), BoxError>> + Send + 'static,
    {
        self.stops.push(Stop {
            name,
            timeout: Some(timeout),
            run: Box::new(stop),
        });
    }

    /// Upper bound on how long [`Self::run`] takes with the given default bound.
    pub fn budget(&self, per_stop: Duration) -> Duration {
        self.stops
            .iter()
            .map(|stop| stop.timeout.unwrap_or(per_stop))
            .sum()
    }

    pub fn len(&self) -> usize {
        self.stops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stops.is_empty()
    }

    /// Runs every stop, last registered first, each bounded by its own timeout or else by
    /// `per_stop`. Errors and timeouts are logged and do not prevent the remaining stops
    /// from running.
    pub async fn run(&mut self, per_stop: Duration) -> SweepReport {
        let mut report = SweepReport::default();
        let started = Instant::now();

        while let Some(Stop { name, timeout: bound, run }) = self.stops.pop() {
            let bound = bound.unwrap_or(per_stop);
            match timeout(bound, run()).await {
                Ok(Ok(())) => {
                    debug!(component = name, "Stopped.");
                    report.stopped += 1;
                }
                Ok(Err(e)) => {
                    error!(component = name, error = %e, "Failed to stop cleanly.");
                    report.failed += 1;
                }
                Err(_) => {
                    warn!(component = name, timeout = ?bound, "Timed out while stopping.");
                    report.timed_out += 1;
                }
            }
        }

        debug!(elapsed = ?started.elapsed(), ?report, "Shutdown sweep complete.");
        report
    }
}
