//! Accepting inbound WebSocket connections.

use std::net::SocketAddr;

use futures::FutureExt;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio_rustls::TlsAcceptor;

use crate::handshake::Handshake;
use crate::socket::Role;
use crate::websocket::{Options, WebSocket};
use crate::Result;

/// A TCP listener producing server-side [`WebSocket`]s.
///
/// Accepting returns as soon as the TCP connection exists; the optional TLS
/// accept and the WebSocket upgrade run on the new connection's lifecycle
/// task, so a slow or malicious client never stalls the accept loop. The
/// returned socket starts in `Connecting` and reports the outcome through
/// its state and events.
pub struct Listener {
    inner: TcpListener,
    acceptor: Option<TlsAcceptor>,
    options: Options,
}

impl Listener {
    /// Binds a plain listener on `addr`.
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<Self> {
        Ok(Self {
            inner: TcpListener::bind(addr).await?,
            acceptor: None,
            options: Options::default(),
        })
    }

    /// Serves `wss://` by running a TLS accept on every inbound connection.
    pub fn with_acceptor(mut self, acceptor: TlsAcceptor) -> Self {
        self.acceptor = Some(acceptor);
        self
    }

    /// Options applied to every accepted connection.
    pub fn with_options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    /// The local address the listener is bound to. Useful with port 0.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.local_addr()?)
    }

    /// Waits for the next inbound connection.
    pub async fn accept(&self) -> Result<WebSocket> {
        let (stream, _peer) = self.inner.accept().await?;
        Ok(self.upgrade(stream))
    }

    /// Accepts a pending connection without waiting. Returns `Ok(None)` when
    /// no connection is queued.
    pub fn try_accept(&self) -> Result<Option<WebSocket>> {
        match self.inner.accept().now_or_never() {
            None => Ok(None),
            Some(Err(error)) => Err(error.into()),
            Some(Ok((stream, _peer))) => Ok(Some(self.upgrade(stream))),
        }
    }

    fn upgrade(&self, stream: TcpStream) -> WebSocket {
        match &self.acceptor {
            None => {
                WebSocket::with_stream(stream, Role::Server, Handshake::Server, self.options.clone())
            }
            Some(acceptor) => {
                let acceptor = acceptor.clone();
                WebSocket::with_pending_stream(
                    async move { Ok(acceptor.accept(stream).await?) },
                    Role::Server,
                    Handshake::Server,
                    self.options.clone(),
                )
            }
        }
    }
}
