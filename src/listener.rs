// SPDX-License-Identifier: Apache-2.0

use std::io;
use std::net::SocketAddr;
use tokio::net::TcpListener as AsyncTcpListener;
use tokio_stream::wrappers::TcpListenerStream;

/// Failure to bind or listen on a receiver address, e.g. the port is already in use.
#[derive(Debug, thiserror::Error)]
#[error("unable to bind to {address}: {source}")]
pub struct BindError {
    pub address: SocketAddr,
    #[source]
    pub source: io::Error,
}

/// Represents a TCP socket that is both bound and configured for listening.
///
/// Because it is a bit confusing when comparing these terms to the Berkeley socket model, creating
/// a Listener calls both:
///  1) bind()
///  2) listen()
/// Therefore, it is ready to accept() connections after success here. Dropping the listener
/// (or the stream it is converted into) closes the socket.
//
pub struct Listener {
    inner: AsyncTcpListener,
}

impl Listener {
    pub async fn listen(endpoint: SocketAddr) -> Result<Self, BindError> {
        match AsyncTcpListener::bind(endpoint).await {
            Ok(l) => Ok(Self { inner: l }),
            Err(e) => Err(BindError {
                address: endpoint,
                source: e,
            }),
        }
    }

    pub fn bound_address(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    pub fn into_async(self) -> AsyncTcpListener {
        self.inner
    }

    pub fn into_stream(self) -> TcpListenerStream {
        TcpListenerStream::new(self.inner)
    }
}
