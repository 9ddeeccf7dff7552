// SPDX-License-Identifier: Apache-2.0

use crate::exporters::Sink;
use crate::init::config::{AgentConfig, ConfigError, ResolvedConfig};
use crate::init::exporters::build_exporters;
use crate::init::receivers::{start_interaction_endpoint, start_trace_endpoint};
use crate::init::wait::{ShutdownSweep, SweepReport};
use crate::receivers::{Endpoint, EndpointError};
use crate::telemetry::Telemetry;
use crate::topology::fanout::Fanout;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower::BoxError;
use tracing::{error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to start the {endpoint} endpoint: {source}")]
    Endpoint {
        endpoint: &'static str,
        #[source]
        source: EndpointError,
    },
}

/// Wires receivers, buffers and exporters together from a configuration.
pub struct Agent {
    config: AgentConfig,
    exporters: Vec<Box<dyn Sink>>,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            exporters: Vec::new(),
        }
    }

    /// Adds an exporter next to the ones built from the `exporters` section.
    pub fn with_exporter(mut self, exporter: Box<dyn Sink>) -> Self {
        self.exporters.push(exporter);
        self
    }

    /// Starts every enabled endpoint. When an endpoint fails to start, whatever was
    /// already started is stopped again before the error is returned.
    pub async fn start(self) -> Result<RunningAgent, AgentError> {
        info!("Starting ocagent.");

        let config = self.config.resolve()?;
        let telemetry = Telemetry::new();

        let mut exporters = build_exporters(&config.exporters)?;
        exporters.extend(self.exporters);
        if exporters.is_empty() {
            warn!("No exporters configured, received telemetry will be discarded.");
        }

        let fanout = Arc::new(
            exporters
                .into_iter()
                .fold(Fanout::builder(), |b, exp| b.add_exporter(exp))
                .with_export_timeout(config.export_timeout)
                .with_failed_batches_counter(telemetry.u64_counter(
                    "ocagent_exporter_failed_batches",
                    "Number of batches an exporter failed to export",
                    "batches",
                ))
                .build(),
        );
        info!(exporters = fanout.len(), "Exporters ready.");

        let mut sweep = ShutdownSweep::new();
        {
            let fanout = fanout.clone();
            let deadline = config.export_timeout;
            let budget = config.shutdown_timeout.max(fanout.close_budget(deadline));
            sweep.register_with_timeout("exporters", budget, move || {
                Box::pin(async move { fanout.close(deadline).await.map_err(BoxError::from) })
            });
        }

        let trace = match start_trace_endpoint(&config.trace, fanout.clone(), &telemetry).await
        {
            Ok(endpoint) => Arc::new(endpoint),
            Err(source) => {
                abort_start(&mut sweep, &telemetry, config.shutdown_timeout).await;
                return Err(AgentError::Endpoint {
                    endpoint: "trace",
                    source,
                });
            }
        };
        register_endpoint(&mut sweep, "trace endpoint", &trace, &config);

        let interaction = match &config.interaction {
            None => {
                info!("Interaction endpoint is disabled.");
                None
            }
            Some(interaction) => {
                match start_interaction_endpoint(interaction, fanout.clone(), &telemetry).await {
                    Ok(endpoint) => Some(Arc::new(endpoint)),
                    Err(source) => {
                        abort_start(&mut sweep, &telemetry, config.shutdown_timeout).await;
                        return Err(AgentError::Endpoint {
                            endpoint: "interaction",
                            source,
                        });
                    }
                }
            }
        };
        if let Some(endpoint) = &interaction {
            register_endpoint(&mut sweep, "interaction endpoint", endpoint, &config);
        }

        Ok(RunningAgent {
            trace,
            interaction,
            sweep,
            telemetry,
            shutdown_timeout: config.shutdown_timeout,
        })
    }
}

// An endpoint stop covers its listeners' grace and the final flush, so it may outlast the
// configured shutdown timeout.
fn register_endpoint(
    sweep: &mut ShutdownSweep,
    name: &'static str,
    endpoint: &Arc<Endpoint>,
    config: &ResolvedConfig,
) {
    let budget = config
        .shutdown_timeout
        .max(endpoint.stop_budget(config.export_timeout));
    let endpoint = endpoint.clone();
    sweep.register_with_timeout(name, budget, move || {
        Box::pin(async move {
            endpoint.stop().await;
            Ok::<(), BoxError>(())
        })
    });
}

async fn abort_start(sweep: &mut ShutdownSweep, telemetry: &Telemetry, per_stop: Duration) {
    sweep.run(per_stop).await;
    telemetry.shutdown();
}

/// A started agent. Dropping it without calling [`RunningAgent::shutdown`] leaves
/// buffered records unflushed.
pub struct RunningAgent {
    trace: Arc<Endpoint>,
    interaction: Option<Arc<Endpoint>>,
    sweep: ShutdownSweep,
    telemetry: Telemetry,
    shutdown_timeout: Duration,
}

impl RunningAgent {
    pub fn trace_addr(&self) -> Option<SocketAddr> {
        self.trace.local_addr("grpc")
    }

    pub fn interaction_grpc_addr(&self) -> Option<SocketAddr> {
        self.interaction.as_ref().and_then(|e| e.local_addr("grpc"))
    }

    pub fn interaction_http_addr(&self) -> Option<SocketAddr> {
        self.interaction.as_ref().and_then(|e| e.local_addr("http"))
    }

    /// Forces every endpoint buffer to forward what it holds. Returns the number of
    /// records forwarded.
    pub async fn flush(&self) -> usize {
        let mut flushed = 0;
        for endpoint in std::iter::once(&self.trace).chain(self.interaction.iter()) {
            match endpoint.flush().await {
                Ok(n) => flushed += n,
                Err(e) => error!(endpoint = endpoint.name(), error = %e, "Failed to flush."),
            }
        }
        flushed
    }

    /// Upper bound on how long [`Self::shutdown`] takes.
    pub fn shutdown_budget(&self) -> Duration {
        self.sweep.budget(self.shutdown_timeout)
    }

    /// Stops endpoints, flushing their buffers, then closes the exporters. Each step is
    /// bounded by the shutdown timeout, or longer when it has to wait out a running
    /// export. Failures are logged and do not interrupt the sweep.
    pub async fn shutdown(mut self) -> SweepReport {
        info!("Shutting down ocagent.");
        let report = self.sweep.run(self.shutdown_timeout).await;
        self.telemetry.shutdown();
        info!(
            stopped = report.stopped,
            failed = report.failed,
            timed_out = report.timed_out,
            "Shutdown complete."
        );
        report
    }
}
