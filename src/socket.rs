//! The masking-aware transport adapter binding a byte stream to frame I/O.
//!
//! [`FrameSocket`] is a thin layer: encode/decode through [`Codec`], plus the
//! directional masking policy. A client masks every outgoing frame; a server
//! receives only masked frames and unmasks them. The reverse direction is
//! enforced as well: a server never masks, so a client rejects masked frames.
//! No buffering or queueing lives here.

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

use crate::codec::Codec;
use crate::frame::Frame;
use crate::{Result, WebSocketError};

/// Which side of the connection this endpoint plays, fixed at construction.
///
/// The role decides the masking direction: the client masks outgoing frames
/// and the server unmasks incoming ones, per RFC 6455 Section 5.1.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Client => write!(f, "client"),
            Role::Server => write!(f, "server"),
        }
    }
}

/// Frame-level socket over an upgraded byte stream.
pub(crate) struct FrameSocket<S> {
    framed: Framed<S, Codec>,
    role: Role,
}

impl<S> FrameSocket<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Binds an already-upgraded stream. `max_payload_size` caps decoded
    /// frame payloads.
    pub fn new(stream: S, role: Role, max_payload_size: usize) -> Self {
        Self {
            framed: Framed::new(stream, Codec::new(max_payload_size)),
            role,
        }
    }

    /// Splits into independently usable send and receive halves, so the
    /// outbound and inbound pumps can run concurrently.
    pub fn split(self) -> (FrameSink<S>, FrameStream<S>) {
        let role = self.role;
        let (sink, stream) = self.framed.split();
        (FrameSink { sink, role }, FrameStream { stream, role })
    }
}

/// Send half of a [`FrameSocket`].
pub(crate) struct FrameSink<S> {
    sink: SplitSink<Framed<S, Codec>, Frame>,
    role: Role,
}

impl<S> FrameSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Masks the frame when operating as a client, then encodes and writes
    /// it, flushing to the wire.
    pub async fn send(&mut self, mut frame: Frame) -> Result<()> {
        if self.role == Role::Client {
            frame.mask()?;
        }
        self.sink.send(frame).await
    }

    /// Flushes pending bytes and shuts the transport down, releasing the
    /// underlying stream.
    pub async fn close(&mut self) -> Result<()> {
        self.sink.close().await
    }
}

/// Receive half of a [`FrameSocket`].
pub(crate) struct FrameStream<S> {
    stream: SplitStream<Framed<S, Codec>>,
    role: Role,
}

impl<S> FrameStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Reads and decodes the next frame, enforcing the directional masking
    /// rule and unmasking server-side.
    ///
    /// # Errors
    /// - [`WebSocketError::UnmaskedFrame`] when a server receives an
    ///   unmasked frame.
    /// - [`WebSocketError::UnexpectedMaskedFrame`] when a client receives a
    ///   masked frame.
    /// - An `UnexpectedEof` I/O error when the stream ends, mid-frame or
    ///   between frames. EOF is fatal to the connection either way.
    pub async fn receive(&mut self) -> Result<Frame> {
        let mut frame = match self.stream.next().await {
            Some(frame) => frame?,
            None => {
                return Err(WebSocketError::IoError(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "stream closed",
                )))
            }
        };

        match self.role {
            Role::Server => {
                if !frame.is_masked() {
                    return Err(WebSocketError::UnmaskedFrame);
                }
                frame.unmask();
            }
            Role::Client => {
                if frame.is_masked() {
                    return Err(WebSocketError::UnexpectedMaskedFrame);
                }
            }
        }
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MAX_PAYLOAD_READ;
    use crate::frame::OpCode;

    fn pair(
        client_buf: usize,
    ) -> (
        FrameSocket<tokio::io::DuplexStream>,
        FrameSocket<tokio::io::DuplexStream>,
    ) {
        let (client_io, server_io) = tokio::io::duplex(client_buf);
        (
            FrameSocket::new(client_io, Role::Client, MAX_PAYLOAD_READ),
            FrameSocket::new(server_io, Role::Server, MAX_PAYLOAD_READ),
        )
    }

    #[tokio::test]
    async fn test_client_to_server_roundtrip_is_masked_on_wire() {
        let (client, server) = pair(4096);
        let (mut client_sink, _client_stream) = client.split();
        let (_server_sink, mut server_stream) = server.split();

        client_sink.send(Frame::text("over the wire")).await.unwrap();

        let frame = server_stream.receive().await.unwrap();
        assert_eq!(frame.opcode, OpCode::Text);
        assert!(!frame.is_masked()); // already unmasked by the server side
        assert_eq!(&frame.payload[..], b"over the wire");
    }

    #[tokio::test]
    async fn test_server_to_client_is_unmasked() {
        let (client, server) = pair(4096);
        let (_client_sink, mut client_stream) = client.split();
        let (mut server_sink, _server_stream) = server.split();

        server_sink.send(Frame::binary(&[1, 2, 3][..])).await.unwrap();

        let frame = client_stream.receive().await.unwrap();
        assert!(!frame.is_masked());
        assert_eq!(&frame.payload[..], &[1, 2, 3]);
    }

    #[tokio::test]
    async fn test_server_rejects_unmasked_frame() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        // Misconfigured peer: a "server" socket writing to our server, so
        // its frames arrive unmasked.
        let rogue = FrameSocket::new(client_io, Role::Server, MAX_PAYLOAD_READ);
        let server = FrameSocket::new(server_io, Role::Server, MAX_PAYLOAD_READ);

        let (mut rogue_sink, _) = rogue.split();
        let (_, mut server_stream) = server.split();

        rogue_sink.send(Frame::text("bare")).await.unwrap();
        let err = server_stream.receive().await.unwrap_err();
        assert!(matches!(err, WebSocketError::UnmaskedFrame));
    }

    #[tokio::test]
    async fn test_client_rejects_masked_frame() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let client = FrameSocket::new(client_io, Role::Client, MAX_PAYLOAD_READ);
        // Misconfigured peer: a "client" socket on the server side masks its
        // frames, which a real server never does.
        let rogue = FrameSocket::new(server_io, Role::Client, MAX_PAYLOAD_READ);

        let (_, mut client_stream) = client.split();
        let (mut rogue_sink, _) = rogue.split();

        rogue_sink.send(Frame::text("masked")).await.unwrap();
        let err = client_stream.receive().await.unwrap_err();
        assert!(matches!(err, WebSocketError::UnexpectedMaskedFrame));
    }

    #[tokio::test]
    async fn test_eof_is_fatal() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let server = FrameSocket::new(server_io, Role::Server, MAX_PAYLOAD_READ);
        drop(client_io);

        let (_, mut server_stream) = server.split();
        let err = server_stream.receive().await.unwrap_err();
        assert!(matches!(err, WebSocketError::IoError(_)));
    }
}
