//! The opening HTTP/1.1 upgrade exchange defined in
//! [RFC 6455 Section 4](https://datatracker.ietf.org/doc/html/rfc6455#section-4).
//!
//! Both roles share the same framing: the header block is read off the raw
//! stream up to and including the blank-line terminator, parsed with
//! [`httparse`], and validated field by field. The reader never consumes
//! bytes past the terminator, since everything after it already belongs to
//! frame traffic.
//!
//! A handshake failure is fatal to the connection attempt: the stream is
//! released and no frame is ever exchanged.

use base64::prelude::*;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Result, WebSocketError};

/// GUID appended to the client key before hashing, fixed by RFC 6455.
const WEBSOCKET_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Upper bound on the HTTP header block; larger blocks fail the handshake.
const MAX_HEADER_BLOCK: usize = 8 * 1024;

const MAX_HEADERS: usize = 32;

/// One side of the opening handshake, fixed per connection.
pub(crate) enum Handshake {
    /// Sends the upgrade request and validates the 101 response.
    Client {
        host: String,
        port: u16,
        path: String,
    },
    /// Validates the upgrade request and sends the 101 response.
    Server,
}

impl Handshake {
    /// Runs the handshake over `stream`. On success the stream is positioned
    /// exactly at the first frame byte.
    pub async fn perform<S>(&self, stream: &mut S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match self {
            Handshake::Client { host, port, path } => {
                perform_client(stream, host, *port, path).await
            }
            Handshake::Server => perform_server(stream).await,
        }
    }
}

/// Generates the random 16-byte nonce for `Sec-WebSocket-Key`.
pub(crate) fn generate_key() -> String {
    let input: [u8; 16] = rand::random();
    BASE64_STANDARD.encode(input)
}

/// Derives the `Sec-WebSocket-Accept` value for a key:
/// `base64(SHA1(key + GUID))`.
pub(crate) fn accept_key(key: &[u8]) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key);
    sha1.update(WEBSOCKET_GUID);
    let result = sha1.finalize();
    BASE64_STANDARD.encode(&result[..])
}

async fn perform_client<S>(stream: &mut S, host: &str, port: u16, path: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let key = generate_key();
    let request = format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {host}:{port}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n\
         \r\n"
    );
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let block = read_header_block(stream).await?;

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);
    match response.parse(&block)? {
        httparse::Status::Complete(_) => {}
        httparse::Status::Partial => {
            return Err(WebSocketError::IoError(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "truncated handshake response",
            )))
        }
    }

    if response.version != Some(1) {
        return Err(WebSocketError::InvalidHttpVersion);
    }
    match response.code {
        Some(101) => {}
        code => return Err(WebSocketError::InvalidStatusCode(code.unwrap_or(0))),
    }
    if !header_matches(response.headers, "Upgrade", "websocket") {
        return Err(WebSocketError::InvalidUpgradeHeader);
    }
    if !header_matches(response.headers, "Connection", "upgrade") {
        return Err(WebSocketError::InvalidConnectionHeader);
    }
    if header_value(response.headers, "Sec-WebSocket-Accept") != Some(accept_key(key.as_bytes())) {
        return Err(WebSocketError::InvalidSecWebSocketAccept);
    }
    // No protocol or extension was offered, so none may be selected.
    if header_value(response.headers, "Sec-WebSocket-Protocol").is_some()
        || header_value(response.headers, "Sec-WebSocket-Extensions").is_some()
    {
        return Err(WebSocketError::UnexpectedNegotiation);
    }

    Ok(())
}

async fn perform_server<S>(stream: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let block = read_header_block(stream).await?;

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut headers);
    match request.parse(&block)? {
        httparse::Status::Complete(_) => {}
        httparse::Status::Partial => {
            return Err(WebSocketError::IoError(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "truncated handshake request",
            )))
        }
    }

    if request.method != Some("GET") {
        return Err(WebSocketError::InvalidUpgradeRequest);
    }
    if request.version != Some(1) {
        return Err(WebSocketError::InvalidHttpVersion);
    }
    if !header_matches(request.headers, "Upgrade", "websocket") {
        return Err(WebSocketError::InvalidUpgradeHeader);
    }
    if !header_matches(request.headers, "Connection", "upgrade") {
        return Err(WebSocketError::InvalidConnectionHeader);
    }
    if header_value(request.headers, "Sec-WebSocket-Version").as_deref() != Some("13") {
        return Err(WebSocketError::InvalidSecWebsocketVersion);
    }
    let key = header_value(request.headers, "Sec-WebSocket-Key")
        .ok_or(WebSocketError::MissingSecWebSocketKey)?;
    // A well-formed key decodes to exactly the 16 nonce bytes.
    match BASE64_STANDARD.decode(key.as_bytes()) {
        Ok(nonce) if nonce.len() == 16 => {}
        _ => return Err(WebSocketError::InvalidSecWebSocketKey),
    }

    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\
         \r\n",
        accept_key(key.as_bytes())
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;

    Ok(())
}

/// Reads the HTTP header block up to and including the `\r\n\r\n` terminator
/// without consuming any byte past it.
async fn read_header_block<S>(stream: &mut S) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; MAX_HEADER_BLOCK];
    let mut filled = 0usize;

    loop {
        let safe = safely_readable(&buf[..filled]);
        if safe == 0 {
            buf.truncate(filled);
            return Ok(buf);
        }
        if filled + safe > buf.len() {
            return Err(WebSocketError::HandshakeHeadersTooLarge);
        }

        let read = stream.read(&mut buf[filled..filled + safe]).await?;
        if read == 0 {
            return Err(WebSocketError::IoError(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "stream closed during handshake",
            )));
        }
        filled += read;
    }
}

/// How many bytes can be read without risking consuming anything after the
/// header terminator, judged from the last four bytes seen.
///
/// Returns 0 when the terminator is complete.
fn safely_readable(buf: &[u8]) -> usize {
    if buf.len() < 4 {
        return 4 - buf.len();
    }
    let last: [u8; 4] = buf[buf.len() - 4..].try_into().expect("4-byte window");

    match last {
        // Terminator complete.
        [b'\r', b'\n', b'\r', b'\n'] => 0,
        // "\r\n\r" seen, only the final "\n" may follow.
        [_, b'\r', b'\n', b'\r'] => 1,
        // A lone "\r": up to "\n\r\n" may complete the terminator.
        [_, _, _, b'\r'] => 3,
        // "\n\r\n" or "\r\n" at the end: "\r\n" may still follow.
        [_, b'\n', b'\r', b'\n'] => 2,
        [_, _, b'\r', b'\n'] => 2,
        _ => 4,
    }
}

fn header_value(headers: &[httparse::Header<'_>], name: &str) -> Option<String> {
    headers
        .iter()
        .find(|header| header.name.eq_ignore_ascii_case(name))
        .and_then(|header| std::str::from_utf8(header.value).ok())
        .map(|value| value.trim().to_owned())
}

fn header_matches(headers: &[httparse::Header<'_>], name: &str, expected: &str) -> bool {
    header_value(headers, name)
        .map(|value| value.eq_ignore_ascii_case(expected))
        .unwrap_or(false)
}
