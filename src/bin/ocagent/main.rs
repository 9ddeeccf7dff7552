// SPDX-License-Identifier: Apache-2.0

use clap::{Parser, ValueEnum};
use ocagent::init::agent::Agent;
use ocagent::init::config::AgentConfig;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio::select;
use tokio::signal::unix::{Signal, SignalKind, signal};
use tokio::time::{Instant, timeout};
use tower::BoxError;
use tracing::metadata::LevelFilter;
use tracing::{error, info, warn};
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_log::LogTracer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry};

const FORCE_FLUSH_TIMEOUT: Duration = Duration::from_secs(3);

// Added on top of the per-stop bounds the agent already enforces
const SHUTDOWN_SLACK: Duration = Duration::from_secs(2);

#[derive(Debug, Parser)]
#[command(name = "ocagent")]
#[command(bin_name = "ocagent")]
#[command(version, about, long_about = None)]
struct Arguments {
    #[arg(value_enum, long, env = "OCAGENT_LOG_FORMAT", default_value = "text")]
    /// Log format
    log_format: LogFormatArg,

    #[arg(long, env = "OCAGENT_CONFIG")]
    /// Path to the YAML configuration file
    config: PathBuf,
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, ValueEnum)]
pub enum LogFormatArg {
    Text,
    Json,
}

fn main() -> ExitCode {
    let opt = Arguments::parse();

    let config = match AgentConfig::load(&opt.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("ERROR: {}", e);
            return ExitCode::from(1);
        }
    };

    let _guard = match setup_logging(&opt.log_format) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("ERROR: failed to setup logging: {}", e);
            return ExitCode::from(1);
        }
    };

    info!(version = %get_version(), "ocagent starting.");

    match run_agent(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Failed to run agent.");
            ExitCode::from(1)
        }
    }
}

#[tokio::main]
async fn run_agent(config: AgentConfig) -> Result<(), BoxError> {
    let mut sig_term = sig(SignalKind::terminate())?;
    let mut sig_int = sig(SignalKind::interrupt())?;
    let mut sig_usr1 = sig(SignalKind::user_defined1())?;

    let agent = Agent::new(config).start().await?;

    loop {
        select! {
            _ = sig_term.recv() => {
                info!("Signal SIGTERM received.");
                break;
            },
            _ = sig_int.recv() => {
                info!("Signal SIGINT received.");
                break;
            },
            _ = sig_usr1.recv() => {
                info!("Signal SIGUSR1 received, invoking a forced flush");
                let flush_start = Instant::now();
                match timeout(FORCE_FLUSH_TIMEOUT, agent.flush()).await {
                    Ok(records) => {
                        let duration = Instant::now().duration_since(flush_start);
                        info!(records, ?duration, "Finished forced flush request");
                    }
                    Err(_) => warn!("Timed out waiting for forced flush."),
                }
            },
        }
    }

    let shutdown_wait = agent.shutdown_budget() + SHUTDOWN_SLACK;
    if timeout(shutdown_wait, agent.shutdown()).await.is_err() {
        return Err(format!("shutdown did not complete within {:?}", shutdown_wait).into());
    }

    Ok(())
}

type LoggerGuard = tracing_appender::non_blocking::WorkerGuard;

fn setup_logging(log_format: &LogFormatArg) -> Result<LoggerGuard, BoxError> {
    LogTracer::init()?;

    let (non_blocking_writer, guard) = tracing_appender::non_blocking(std::io::stdout());

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()?
        .add_directive("opentelemetry=warn".parse()?)
        .add_directive("opentelemetry_sdk=warn".parse()?)
        .add_directive("h2=warn".parse()?);

    if *log_format == LogFormatArg::Json {
        let app_name = format!("{}-{}", env!("CARGO_PKG_NAME"), get_version());
        let bunyan_formatting_layer = BunyanFormattingLayer::new(app_name, non_blocking_writer);

        let subscriber = Registry::default()
            .with(filter)
            .with(JsonStorageLayer)
            .with(bunyan_formatting_layer);
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        use std::io;
        use std::io::IsTerminal;

        // Skip color codes when not in a terminal
        let use_ansi = io::stdout().is_terminal();

        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_target(false)
            .with_level(true)
            .with_ansi(use_ansi)
            .compact();

        let subscriber = Registry::default().with(filter).with(fmt_layer);
        tracing::subscriber::set_global_default(subscriber)?;
    }
    Ok(guard)
}

fn get_version() -> String {
    // Set during CI
    let version_build = option_env!("BUILD_SHORT_SHA").unwrap_or("dev");

    format!("{}-{}", env!("CARGO_PKG_VERSION"), version_build)
}

fn sig(kind: SignalKind) -> Result<Signal, BoxError> {
    signal(kind).map_err(|e| format!("failed to install {:?} handler: {}", kind, e).into())
}
