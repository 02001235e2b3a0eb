//! # qws
//! A queued, event-driven implementation of the WebSocket protocol (RFC 6455)
//! for tokio, covering both clients and servers.
//!
//! Applications work with whole messages, never raw frames: sends are queued
//! for a background writer, inbound frames are reassembled into complete
//! messages, and control traffic (ping, pong, close) is handled entirely
//! under the hood. Keepalive pings go out on a timer and the closing
//! handshake runs to completion on either side's initiative.
//!
//! Messages can be consumed two ways: pull them with [`WebSocket::receive`]
//! (or [`WebSocket::try_receive`]), or register an
//! [`on_message`](WebSocket::on_message) handler and let a [`Poller`] drive
//! delivery. Lifecycle transitions surface both as [`ConnectionState`] and
//! as connected / closing / closed events.
//!
//! # Features
//! - `logging`: Enables debug logging for handshakes, shutdown and protocol
//!   violations using the `log` crate.
//!
//! # Client Example
//! ```no_run
//! use qws::WebSocket;
//!
//! async fn echo_once() -> qws::Result<()> {
//!     let ws = WebSocket::connect("wss://echo.websocket.org/".parse()?).await?;
//!
//!     ws.send_text("hello").await?;
//!     let reply = ws.receive().await?;
//!     println!("{reply:?}");
//!
//!     ws.close();
//!     Ok(())
//! }
//! ```
//!
//! # Server Example
//! ```no_run
//! use qws::Listener;
//!
//! async fn serve() -> qws::Result<()> {
//!     let listener = Listener::bind("127.0.0.1:9001").await?;
//!     loop {
//!         let ws = listener.accept().await?;
//!         tokio::spawn(async move {
//!             while let Ok(message) = ws.receive().await {
//!                 let _ = ws.send(message).await;
//!             }
//!         });
//!     }
//! }
//! ```

pub mod close;
pub mod codec;
pub mod frame;
pub mod queue;

mod connection;
mod events;
mod handshake;
mod listener;
mod mask;
mod message;
mod poller;
mod socket;
mod websocket;

use thiserror::Error;

pub use close::CloseCode;
pub use codec::MAX_PAYLOAD_READ;
pub use connection::{ConnectionState, DEFAULT_CLOSE_TIMEOUT, DEFAULT_PING_INTERVAL};
pub use frame::{Frame, OpCode};
pub use listener::Listener;
pub use message::Message;
pub use poller::{Poller, PollerHandle};
pub use queue::{AsyncQueue, DEFAULT_BUFFER_LIMIT};
pub use socket::Role;
pub use websocket::{ClosingSendPolicy, Options, WebSocket, WebSocketBuilder};

/// A result type for WebSocket operations, using `WebSocketError` as the
/// error type.
pub type Result<T> = std::result::Result<T, WebSocketError>;

/// Represents errors that can occur during WebSocket operations.
///
/// The variants fall into a few broad groups: frame-level protocol errors
/// surfaced by the codec, fragmentation and UTF-8 errors from message
/// reassembly, handshake failures, lifecycle errors from operating on a
/// closing or closed connection, and I/O errors from the transport.
#[derive(Error, Debug)]
pub enum WebSocketError {
    /// A new data frame arrived while a fragmented message was still in
    /// progress. RFC 6455 forbids interleaving messages.
    #[error("Invalid fragment")]
    InvalidFragment,

    /// A continuation frame arrived with no message in progress.
    #[error("Invalid continuation frame")]
    InvalidContinuationFrame,

    /// A completed text message is not valid UTF-8.
    #[error("Invalid UTF-8")]
    InvalidUTF8,

    /// A frame header carries an opcode outside the set RFC 6455 defines.
    #[error("Invalid opcode (byte={0})")]
    InvalidOpCode(u8),

    /// Reserved bits in a frame header are set. With no extension
    /// negotiated they must be zero.
    #[error("Reserved bits are not zero")]
    ReservedBitsNotZero,

    /// A control frame arrived without the FIN bit. Control frames must not
    /// be fragmented.
    #[error("Control frame must not be fragmented")]
    ControlFrameFragmented,

    /// A ping frame exceeds the 125-byte payload bound for control frames.
    #[error("Ping frame too large")]
    PingFrameTooLarge,

    /// A frame payload exceeds the configured maximum read size.
    #[error("Frame too large")]
    FrameTooLarge,

    /// [`Frame::mask`] was called on an already-masked frame. Masking twice
    /// would corrupt the payload.
    #[error("Frame is already masked")]
    AlreadyMasked,

    /// A server received an unmasked frame. Clients must mask every frame
    /// they send.
    #[error("Received an unmasked frame")]
    UnmaskedFrame,

    /// A client received a masked frame. Servers must not mask.
    #[error("Received an unexpectedly masked frame")]
    UnexpectedMaskedFrame,

    /// A pending queue operation was cancelled, either by its token or
    /// because the queue closed underneath it.
    #[error("Operation cancelled")]
    Cancelled,

    /// The connection is closed; no further communication is possible.
    #[error("Connection is closed")]
    ConnectionClosed,

    /// A send was rejected because the closing handshake is underway and
    /// the socket is configured with [`ClosingSendPolicy::Reject`].
    #[error("Connection is closing")]
    ConnectionClosing,

    /// The handshake response status was not `101 Switching Protocols`.
    #[error("Invalid status code: {0}")]
    InvalidStatusCode(u16),

    /// The `Upgrade` header is missing or does not say `websocket`.
    #[error("Invalid upgrade header")]
    InvalidUpgradeHeader,

    /// The `Connection` header is missing or does not say `Upgrade`.
    #[error("Invalid connection header")]
    InvalidConnectionHeader,

    /// The handshake request is not a well-formed `GET` upgrade request.
    #[error("Invalid upgrade request")]
    InvalidUpgradeRequest,

    /// The handshake used an HTTP version other than 1.1.
    #[error("Invalid HTTP version")]
    InvalidHttpVersion,

    /// The URL scheme is neither `ws` nor `wss`.
    #[error("Invalid HTTP scheme")]
    InvalidHttpScheme,

    /// The `Sec-WebSocket-Version` header is not 13.
    #[error("Sec-Websocket-Version must be 13")]
    InvalidSecWebsocketVersion,

    /// The client request lacks the `Sec-WebSocket-Key` header.
    #[error("Missing Sec-WebSocket-Key header")]
    MissingSecWebSocketKey,

    /// The `Sec-WebSocket-Key` value does not decode to a 16-byte nonce.
    #[error("Invalid Sec-WebSocket-Key header")]
    InvalidSecWebSocketKey,

    /// The server's `Sec-WebSocket-Accept` does not match the key sent.
    #[error("Invalid Sec-WebSocket-Accept header")]
    InvalidSecWebSocketAccept,

    /// The server selected a subprotocol or extension that was never
    /// offered.
    #[error("Server negotiated an unoffered protocol or extension")]
    UnexpectedNegotiation,

    /// The handshake header block exceeds the supported size.
    #[error("Handshake headers too large")]
    HandshakeHeadersTooLarge,

    /// The handshake header block could not be parsed as HTTP.
    #[error("HTTP parse error: {0}")]
    HttpParse(#[from] httparse::Error),

    /// An I/O error occurred on the underlying transport.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// A URL failed to parse.
    #[error("URL parse error: {0}")]
    UrlParseError(#[from] url::ParseError),
}
