// SPDX-License-Identifier: Apache-2.0

pub mod agent_grpc;
pub mod agent_output;
pub mod interaction_http;

use crate::listener::BindError;
use crate::topology::batch::BufferPolicyError;
use crate::topology::span_buffer::{AcceptError, SpanBuffer};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tower::BoxError;
use tracing::{debug, error, warn};

/// How long a stopped server may take to wind down open connections before it is aborted.
pub const SERVER_STOP_GRACE: Duration = Duration::from_secs(2);

const STOP_SLACK: Duration = Duration::from_millis(500);

/// Reasons an inbound message, or a record inside it, is dropped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("first message of the stream did not identify its node")]
    MissingNode,

    #[error("trace id must be 16 bytes, got {0}")]
    InvalidTraceId(usize),

    #[error("span id must be 8 bytes, got {0}")]
    InvalidSpanId(usize),

    #[error("malformed message: {0}")]
    Malformed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error(transparent)]
    Bind(#[from] BindError),

    #[error("invalid buffer policy: {0}")]
    Policy(#[from] BufferPolicyError),
}

/// A running listener task. Stopping cancels the accept loop, then waits a bounded
/// time for in-flight connections before aborting the task.
pub struct ServerHandle {
    name: &'static str,
    addr: SocketAddr,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ServerHandle {
    pub(crate) fn spawn<F>(name: &'static str, addr: SocketAddr, cancel: CancellationToken, fut: F) -> Self
    where
        F: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let jh = tokio::spawn(async move {
            if let Err(e) = fut.await {
                error!(server = name, error = %e, "Receiver server exited with error.");
            }
        });

        Self {
            name,
            addr,
            cancel,
            task: Mutex::new(Some(jh)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn stop(&self) {
        self.cancel.cancel();

        let jh = self.task.lock().ok().and_then(|mut t| t.take());
        let Some(mut jh) = jh else {
            return;
        };
        match timeout(SERVER_STOP_GRACE, &mut jh).await {
            Ok(Ok(())) => debug!(server = self.name, address = %self.addr, "Receiver server stopped."),
            Ok(Err(e)) => error!(server = self.name, error = ?e, "Receiver server task failed."),
            Err(_) => {
                warn!(server = self.name, "Receiver server did not stop in time, aborting.");
                jh.abort();
            }
        }
    }
}

/// A receiver endpoint: one or more listeners feeding a single span buffer.
pub struct Endpoint {
    name: &'static str,
    servers: Vec<ServerHandle>,
    buffer: Option<SpanBuffer>,
}

impl Endpoint {
    /// An endpoint that has not been started. Stopping it is a no-op.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            servers: Vec::new(),
            buffer: None,
        }
    }

    pub(crate) fn with_buffer(mut self, buffer: SpanBuffer) -> Self {
        self.buffer = Some(buffer);
        self
    }

    pub(crate) fn add_server(&mut self, server: ServerHandle) {
        self.servers.push(server);
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_started(&self) -> bool {
        !self.servers.is_empty()
    }

    /// Bound address of the named listener, e.g. `grpc` or `http`.
    pub fn local_addr(&self, server: &str) -> Option<SocketAddr> {
        self.servers
            .iter()
            .find(|s| s.name() == server)
            .map(|s| s.local_addr())
    }

    pub async fn flush(&self) -> Result<usize, AcceptError> {
        match &self.buffer {
            Some(buffer) => buffer.flush().await,
            None => Ok(0),
        }
    }

    /// Time [`Self::stop`] needs when every listener uses its full grace and the final
    /// flush takes up to `export_timeout`.
    pub fn stop_budget(&self, export_timeout: Duration) -> Duration {
        let servers = u32::try_from(self.servers.len()).unwrap_or(u32::MAX);
        SERVER_STOP_GRACE.saturating_mul(servers) + export_timeout + STOP_SLACK
    }

    /// Closes the listeners, then flushes and stops the buffer. Safe to call repeatedly.
    pub async fn stop(&self) {
        for server in &self.servers {
            server.stop().await;
        }
        if let Some(buffer) = &self.buffer {
            buffer.shutdown().await;
        }
    }
}
