//! The message-level WebSocket facade.
//!
//! [`WebSocket`] is the public surface of the crate: applications send and
//! receive whole [`Message`]s, register lifecycle handlers and close the
//! connection. Underneath, an assembly pump feeds inbound data frames
//! through a [`MessageAssembler`] into a message queue, and outbound
//! messages are split into frames for the connection's outbound queue.
//!
//! Clients connect through [`WebSocket::connect`], which returns a builder
//! implementing `Future`. The future resolves once the TCP (and TLS)
//! transport is up; the protocol upgrade continues in the background, and
//! the connection reports `Connected` through its state and event when the
//! handshake completes. Servers obtain sockets from
//! [`Listener::accept`](crate::Listener::accept).

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{future::BoxFuture, FutureExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::{ServerName, TrustAnchor};
use tokio_rustls::{rustls, TlsConnector};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::connection::{
    Connection, ConnectionConfig, ConnectionState, DEFAULT_CLOSE_TIMEOUT, DEFAULT_PING_INTERVAL,
};
use crate::events::Events;
use crate::handshake::Handshake;
use crate::message::{Message, MessageAssembler};
use crate::queue::{AsyncQueue, DEFAULT_BUFFER_LIMIT};
use crate::socket::Role;
use crate::{Result, WebSocketError};

/// What [`WebSocket::send`] does while the closing handshake is underway.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum ClosingSendPolicy {
    /// Accept the call and drop the message. The connection is going away,
    /// so late sends succeed vacuously.
    #[default]
    Discard,
    /// Fail the call with [`WebSocketError::ConnectionClosing`].
    Reject,
}

/// Configuration options for a WebSocket connection.
#[derive(Debug, Clone)]
pub struct Options {
    /// Bound on both frame queues and the message queue.
    pub buffer_limit: usize,
    /// Interval between keepalive pings.
    pub ping_interval: Duration,
    /// How long to wait for the peer's Close confirmation.
    pub close_timeout: Duration,
    /// Largest accepted inbound frame payload.
    pub max_payload_read: usize,
    /// When set, outbound messages larger than this are fragmented.
    pub fragment_size: Option<NonZeroUsize>,
    /// Behavior of sends during the closing handshake.
    pub closing_send: ClosingSendPolicy,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            buffer_limit: DEFAULT_BUFFER_LIMIT,
            ping_interval: DEFAULT_PING_INTERVAL,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            max_payload_read: crate::codec::MAX_PAYLOAD_READ,
            fragment_size: None,
            closing_send: ClosingSendPolicy::default(),
        }
    }
}

impl Options {
    pub fn with_buffer_limit(mut self, limit: usize) -> Self {
        self.buffer_limit = limit;
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    pub fn with_max_payload_read(mut self, max: usize) -> Self {
        self.max_payload_read = max;
        self
    }

    pub fn with_fragment_size(mut self, size: NonZeroUsize) -> Self {
        self.fragment_size = Some(size);
        self
    }

    pub fn with_closing_send(mut self, policy: ClosingSendPolicy) -> Self {
        self.closing_send = policy;
        self
    }

    fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            buffer_limit: self.buffer_limit,
            ping_interval: self.ping_interval,
            close_timeout: self.close_timeout,
            max_payload_read: self.max_payload_read,
        }
    }
}

/// A queued, event-driven WebSocket endpoint.
///
/// All methods take `&self`; the socket is freely shareable across tasks
/// (wrap it in an [`Arc`] to hand it to several owners). Sending queues the
/// message for the outbound pump and receiving takes the next fully
/// reassembled message, so neither side ever handles partial frames.
pub struct WebSocket {
    connection: Arc<Connection>,
    events: Arc<Events>,
    messages: Arc<AsyncQueue<Message>>,
    fragment_size: Option<NonZeroUsize>,
    closing_send: ClosingSendPolicy,
}

impl WebSocket {
    /// Starts a client connection to `url` (`ws://` or `wss://`).
    ///
    /// Returns a builder that implements `Future`. The future resolves once
    /// the transport is established; the protocol upgrade runs in the
    /// background and completion is observable through
    /// [`WebSocket::state`] or the connected event.
    pub fn connect(url: Url) -> WebSocketBuilder {
        WebSocketBuilder::new(url)
    }

    /// Wires a facade onto an already-established stream.
    pub(crate) fn with_stream<S>(
        stream: S,
        role: Role,
        handshake: Handshake,
        options: Options,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::with_pending_stream(std::future::ready(Ok(stream)), role, handshake, options)
    }

    /// Like [`WebSocket::with_stream`] for a transport still being set up,
    /// such as a server-side TLS accept. The future resolves on the
    /// connection's lifecycle task; a failure surfaces as a closed
    /// connection.
    pub(crate) fn with_pending_stream<S, F>(
        pending: F,
        role: Role,
        handshake: Handshake,
        options: Options,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        F: Future<Output = Result<S>> + Send + 'static,
    {
        let events = Arc::new(Events::new());
        let connection = Connection::spawn(
            pending,
            role,
            handshake,
            Arc::clone(&events),
            options.connection_config(),
        );
        let messages = Arc::new(AsyncQueue::new(options.buffer_limit));

        tokio::spawn(assembly_pump(
            Arc::clone(&connection),
            Arc::clone(&messages),
        ));

        Self {
            connection,
            events,
            messages,
            fragment_size: options.fragment_size,
            closing_send: options.closing_send,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Queues a message for delivery.
    ///
    /// The message is split into frames per the configured fragment size and
    /// the frames are queued as one contiguous run, so concurrent senders
    /// never interleave fragments of different messages.
    ///
    /// # Errors
    /// - [`WebSocketError::ConnectionClosed`] once the connection is closed.
    /// - [`WebSocketError::ConnectionClosing`] during the closing handshake
    ///   under [`ClosingSendPolicy::Reject`]; under the default policy the
    ///   message is silently discarded instead.
    pub async fn send(&self, message: impl Into<Message>) -> Result<()> {
        match self.connection.state() {
            ConnectionState::Closed => Err(WebSocketError::ConnectionClosed),
            ConnectionState::Closing => match self.closing_send {
                ClosingSendPolicy::Discard => Ok(()),
                ClosingSendPolicy::Reject => Err(WebSocketError::ConnectionClosing),
            },
            _ => {
                let frames = message.into().into_frames(self.fragment_size);
                self.connection
                    .send_all(frames)
                    .await
                    .map_err(|_| WebSocketError::ConnectionClosed)
            }
        }
    }

    /// Queues a text message.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.send(Message::Text(text.into())).await
    }

    /// Queues a binary message.
    pub async fn send_binary(&self, data: impl Into<bytes::Bytes>) -> Result<()> {
        self.send(Message::Binary(data.into())).await
    }

    /// Takes the next complete inbound message, waiting for one to arrive.
    ///
    /// # Errors
    /// [`WebSocketError::ConnectionClosed`] when the connection closes with
    /// no buffered message left.
    pub async fn receive(&self) -> Result<Message> {
        self.messages
            .dequeue()
            .await
            .map_err(|_| WebSocketError::ConnectionClosed)
    }

    /// Like [`WebSocket::receive`], but also resolves with
    /// [`WebSocketError::Cancelled`] when `token` fires.
    pub async fn receive_with(&self, token: &CancellationToken) -> Result<Message> {
        self.messages.dequeue_with(token).await.map_err(|_| {
            if self.messages.is_closed() {
                WebSocketError::ConnectionClosed
            } else {
                WebSocketError::Cancelled
            }
        })
    }

    /// Takes a buffered inbound message without waiting.
    ///
    /// Returns `Ok(None)` when nothing is buffered on a live connection.
    /// Buffered messages remain retrievable after closure; only once the
    /// connection is closed *and* drained does this fail with
    /// [`WebSocketError::ConnectionClosed`].
    pub fn try_receive(&self) -> Result<Option<Message>> {
        match self.messages.try_dequeue() {
            Some(message) => Ok(Some(message)),
            None if self.messages.is_closed() => Err(WebSocketError::ConnectionClosed),
            None => Ok(None),
        }
    }

    /// Number of complete messages buffered and ready.
    pub fn available(&self) -> usize {
        self.messages.len()
    }

    /// Starts the closing handshake. The `Closing` state is observable
    /// before this returns. Idempotent.
    pub fn close(&self) {
        self.connection.close();
    }

    /// Registers a handler for the moment the opening handshake completes.
    pub fn on_connected(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.events.on_connected(handler);
    }

    /// Registers a handler for the start of the closing handshake.
    pub fn on_closing(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.events.on_closing(handler);
    }

    /// Registers a handler for the connection settling in `Closed`.
    pub fn on_closed(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.events.on_closed(handler);
    }

    /// Registers a handler invoked by a [`Poller`](crate::Poller) for each
    /// inbound message it drains.
    pub fn on_message(&self, handler: impl Fn(&Message) + Send + Sync + 'static) {
        self.events.on_message(handler);
    }

    pub(crate) fn emit_message(&self, message: &Message) {
        self.events.emit_message(message);
    }
}

/// Reassembles inbound data frames into messages and buffers them.
///
/// A fragmentation or UTF-8 violation is fatal: the connection is closed and
/// the offending message never surfaces. The message queue closes when the
/// frame source does, which is what turns facade receives into
/// `ConnectionClosed`.
async fn assembly_pump(connection: Arc<Connection>, messages: Arc<AsyncQueue<Message>>) {
    let mut assembler = MessageAssembler::new();
    loop {
        let frame = match connection.receive().await {
            Ok(frame) => frame,
            Err(_) => break,
        };
        match assembler.push(frame) {
            Ok(Some(message)) => {
                if messages.enqueue(message).await.is_err() {
                    break;
                }
            }
            Ok(None) => {}
            Err(_error) => {
                #[cfg(feature = "logging")]
                log::debug!("protocol violation in inbound message: {_error}");

                connection.close();
                break;
            }
        }
    }
    messages.close();
}

/// Builder returned by [`WebSocket::connect`].
///
/// Configures the connection, then resolves (as a `Future`) to a connected
/// [`WebSocket`].
pub struct WebSocketBuilder {
    opts: Option<WsBuilderOpts>,
    future: Option<BoxFuture<'static, Result<WebSocket>>>,
}

struct WsBuilderOpts {
    url: Url,
    tcp_address: Option<SocketAddr>,
    connector: Option<TlsConnector>,
    establish_options: Option<Options>,
}

impl WebSocketBuilder {
    fn new(url: Url) -> Self {
        Self {
            opts: Some(WsBuilderOpts {
                url,
                tcp_address: None,
                connector: None,
                establish_options: None,
            }),
            future: None,
        }
    }

    /// Sets a custom TLS connector for `wss://` URLs, replacing the default
    /// webpki-roots based one.
    pub fn with_connector(mut self, connector: TlsConnector) -> Self {
        let Some(opts) = &mut self.opts else {
            unreachable!()
        };
        opts.connector = Some(connector);
        self
    }

    /// Connects to a specific socket address instead of resolving the URL
    /// host, while still using the URL host for the TLS identity and the
    /// Host header.
    pub fn with_tcp_address(mut self, address: SocketAddr) -> Self {
        let Some(opts) = &mut self.opts else {
            unreachable!()
        };
        opts.tcp_address = Some(address);
        self
    }

    /// Sets connection options.
    pub fn with_options(mut self, options: Options) -> Self {
        let Some(opts) = &mut self.opts else {
            unreachable!()
        };
        opts.establish_options = Some(options);
        self
    }
}

impl Future for WebSocketBuilder {
    type Output = Result<WebSocket>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(opts) = this.opts.take() {
            let future = connect_priv(
                opts.url,
                opts.tcp_address,
                opts.connector,
                opts.establish_options.unwrap_or_default(),
            );
            this.future = Some(Box::pin(future));
        }

        let Some(pinned) = &mut this.future else {
            unreachable!()
        };
        pinned.poll_unpin(cx)
    }
}

async fn connect_priv(
    url: Url,
    tcp_address: Option<SocketAddr>,
    connector: Option<TlsConnector>,
    options: Options,
) -> Result<WebSocket> {
    let host = url
        .host_str()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "url has no host"))?
        .to_string();
    let port = url
        .port_or_known_default()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "url has no port"))?;
    let path = match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    };
    let handshake = Handshake::Client {
        host: host.clone(),
        port,
        path,
    };

    let tcp_stream = if let Some(tcp_address) = tcp_address {
        TcpStream::connect(tcp_address).await?
    } else {
        TcpStream::connect(format!("{host}:{port}")).await?
    };

    match url.scheme() {
        "ws" => Ok(WebSocket::with_stream(
            tcp_stream,
            Role::Client,
            handshake,
            options,
        )),
        "wss" => {
            let connector = connector.unwrap_or_else(tls_connector);
            let domain = ServerName::try_from(host)
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid dnsname"))?;
            let tls_stream = connector.connect(domain, tcp_stream).await?;
            Ok(WebSocket::with_stream(
                tls_stream,
                Role::Client,
                handshake,
                options,
            ))
        }
        _ => Err(WebSocketError::InvalidHttpScheme),
    }
}

/// Default TLS connector trusting the webpki root set.
fn tls_connector() -> TlsConnector {
    let mut root_cert_store = rustls::RootCertStore::empty();
    root_cert_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| TrustAnchor {
        subject: ta.subject.clone(),
        subject_public_key_info: ta.subject_public_key_info.clone(),
        name_constraints: ta.name_constraints.clone(),
    }));

    // define the provider if any, fallback to ring
    let provider = rustls::crypto::CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()));

    let mut config = rustls::ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(rustls::ALL_VERSIONS)
        .expect("versions")
        .with_root_certificates(root_cert_store)
        .with_no_client_auth();
    config.alpn_protocols = vec!["http/1.1".into()];

    TlsConnector::from(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn pair(options: Options) -> (WebSocket, WebSocket) {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let client = WebSocket::with_stream(
            client_io,
            Role::Client,
            Handshake::Client {
                host: "localhost".into(),
                port: 80,
                path: "/".into(),
            },
            options.clone(),
        );
        let server = WebSocket::with_stream(server_io, Role::Server, Handshake::Server, options);
        (client, server)
    }

    fn fast_close() -> Options {
        Options::default().with_close_timeout(Duration::from_millis(200))
    }

    async fn wait_for_state(ws: &WebSocket, state: ConnectionState) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while ws.state() < state {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("state not reached in time");
    }

    #[tokio::test]
    async fn test_messages_flow_both_ways() {
        let (client, server) = pair(fast_close());

        client.send_text("hello server").await.unwrap();
        assert_eq!(server.receive().await.unwrap(), Message::text("hello server"));

        server.send_binary(vec![1u8, 2, 3]).await.unwrap();
        assert_eq!(
            client.receive().await.unwrap(),
            Message::binary(vec![1u8, 2, 3])
        );
    }

    #[tokio::test]
    async fn test_fragmented_message_arrives_whole() {
        let options = fast_close().with_fragment_size(NonZeroUsize::new(4).unwrap());
        let (client, server) = pair(options);

        let text = "a message much longer than four bytes";
        client.send_text(text).await.unwrap();
        assert_eq!(server.receive().await.unwrap(), Message::text(text));
    }

    #[tokio::test]
    async fn test_lifecycle_events_fire_in_order() {
        let (client, server) = pair(fast_close());
        let log = Arc::new(Mutex::new(Vec::new()));

        for (name, register) in [
            ("connected", 0),
            ("closing", 1),
            ("closed", 2),
        ] {
            let log = Arc::clone(&log);
            let push = move || log.lock().unwrap().push(name);
            match register {
                0 => client.on_connected(push),
                1 => client.on_closing(push),
                _ => client.on_closed(push),
            }
        }

        wait_for_state(&client, ConnectionState::Connected).await;
        wait_for_state(&server, ConnectionState::Connected).await;
        client.close();
        wait_for_state(&client, ConnectionState::Closed).await;

        let log = log.lock().unwrap();
        // Connected may predate handler registration; closing and closed
        // must both be present and ordered.
        let closing = log.iter().position(|&name| name == "closing").unwrap();
        let closed = log.iter().position(|&name| name == "closed").unwrap();
        assert!(closing < closed);
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (client, server) = pair(fast_close());
        wait_for_state(&client, ConnectionState::Connected).await;

        client.close();
        wait_for_state(&client, ConnectionState::Closed).await;
        wait_for_state(&server, ConnectionState::Closed).await;

        assert!(matches!(
            client.send_text("too late").await,
            Err(WebSocketError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_send_while_closing_discards_by_default() {
        let (client, _server) = pair(fast_close());
        wait_for_state(&client, ConnectionState::Connected).await;

        client.close();
        if client.state() == ConnectionState::Closing {
            client.send_text("dropped quietly").await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_send_while_closing_can_reject() {
        let options = fast_close().with_closing_send(ClosingSendPolicy::Reject);
        let (client, _server) = pair(options);
        wait_for_state(&client, ConnectionState::Connected).await;

        client.close();
        if client.state() == ConnectionState::Closing {
            assert!(matches!(
                client.send_text("rejected").await,
                Err(WebSocketError::ConnectionClosing)
            ));
        }
    }

    #[tokio::test]
    async fn test_try_receive_semantics() {
        let (client, server) = pair(fast_close());
        wait_for_state(&server, ConnectionState::Connected).await;

        assert!(matches!(server.try_receive(), Ok(None)));

        client.send_text("buffered").await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while server.available() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(
            server.try_receive().unwrap(),
            Some(Message::text("buffered"))
        );

        client.close();
        wait_for_state(&server, ConnectionState::Closed).await;
        assert!(matches!(
            server.try_receive(),
            Err(WebSocketError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_receive_with_token_cancellation() {
        let (_client, server) = pair(fast_close());
        wait_for_state(&server, ConnectionState::Connected).await;

        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });

        assert!(matches!(
            server.receive_with(&token).await,
            Err(WebSocketError::Cancelled)
        ));
        // The connection itself is untouched.
        assert_eq!(server.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_concurrent_senders_do_not_interleave_fragments() {
        let options = fast_close().with_fragment_size(NonZeroUsize::new(2).unwrap());
        let (client, server) = pair(options);
        let client = Arc::new(client);
        wait_for_state(&client, ConnectionState::Connected).await;

        let mut tasks = Vec::new();
        for index in 0..8 {
            let client = Arc::clone(&client);
            tasks.push(tokio::spawn(async move {
                client.send_text(format!("message-{index}")).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let received = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let message = server.receive().await.unwrap();
            match message {
                Message::Text(text) => assert!(text.starts_with("message-")),
                _ => panic!("unexpected binary message"),
            }
            received.fetch_add(1, Ordering::SeqCst);
        }
        assert_eq!(received.load(Ordering::SeqCst), 8);
    }
}
