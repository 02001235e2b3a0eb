//! Application-visible messages and their mapping to frames.
//!
//! A [`Message`] is one or more frames: the first frame carries the real
//! opcode (Text or Binary), any further fragments carry
//! [`OpCode::Continuation`], and only the last frame has FIN set.
//! [`Message::into_frames`] performs that split for sending;
//! [`MessageAssembler`] reverses it for receiving, rejecting the frame
//! sequences RFC 6455 forbids.

use std::num::NonZeroUsize;

use bytes::{Bytes, BytesMut};

use crate::frame::{Frame, OpCode};
use crate::{Result, WebSocketError};

/// A complete WebSocket message, immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// UTF-8 text.
    Text(String),
    /// Raw bytes.
    Binary(Bytes),
}

impl Message {
    /// Creates a text message.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    /// Creates a binary message.
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::Binary(data.into())
    }

    /// Returns the payload length in bytes.
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(data) => data.len(),
        }
    }

    /// Returns `true` when the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn opcode(&self) -> OpCode {
        match self {
            Self::Text(_) => OpCode::Text,
            Self::Binary(_) => OpCode::Binary,
        }
    }

    /// Converts the message into the ordered frames that carry it.
    ///
    /// Without a `fragment_size`, or when the payload fits into one
    /// fragment, a single final frame is produced. Otherwise the payload is
    /// split into chunks of at most `fragment_size` bytes: the first frame
    /// carries the message opcode, the rest are continuations, and only the
    /// last has FIN set. An empty message always yields one final frame.
    pub fn into_frames(self, fragment_size: Option<NonZeroUsize>) -> Vec<Frame> {
        let opcode = self.opcode();
        let payload: Bytes = match self {
            Self::Text(text) => Bytes::from(text),
            Self::Binary(data) => data,
        };

        let chunk = match fragment_size {
            Some(size) if payload.len() > size.get() => size.get(),
            _ => {
                return vec![Frame::new(true, opcode, None, payload.as_ref())];
            }
        };

        let mut frames = Vec::with_capacity(payload.len().div_ceil(chunk));
        let mut offset = 0;
        while offset < payload.len() {
            let end = usize::min(offset + chunk, payload.len());
            let opcode = if offset == 0 {
                opcode
            } else {
                OpCode::Continuation
            };
            frames.push(Frame::new(
                end == payload.len(),
                opcode,
                None,
                &payload[offset..end],
            ));
            offset = end;
        }
        frames
    }
}

impl From<&str> for Message {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<String> for Message {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Vec<u8>> for Message {
    fn from(value: Vec<u8>) -> Self {
        Self::Binary(Bytes::from(value))
    }
}

impl From<Bytes> for Message {
    fn from(value: Bytes) -> Self {
        Self::Binary(value)
    }
}

/// Reassembles a run of data frames into one [`Message`].
///
/// Control frames never reach the assembler; the connection layer filters
/// them out. The assembler enforces the fragmentation rules of RFC 6455
/// Section 5.4: a Text or Binary frame may not start while a message is in
/// progress, and a Continuation frame requires one. Both violations are
/// fatal to the connection.
#[derive(Default)]
pub(crate) struct MessageAssembler {
    /// Opcode of the message in progress, `None` between messages.
    opcode: Option<OpCode>,
    buffer: BytesMut,
}

impl MessageAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds the next data frame.
    ///
    /// # Returns
    /// `Ok(Some(message))` when `frame` completes a message, `Ok(None)` when
    /// more fragments are expected.
    ///
    /// # Errors
    /// - [`WebSocketError::InvalidFragment`] for a Text/Binary frame while a
    ///   message is in progress (interleaved messages).
    /// - [`WebSocketError::InvalidContinuationFrame`] for a continuation
    ///   with no message in progress.
    /// - [`WebSocketError::InvalidUTF8`] when a completed text message is
    ///   not valid UTF-8.
    pub fn push(&mut self, frame: Frame) -> Result<Option<Message>> {
        debug_assert!(frame.opcode.is_data());

        match frame.opcode {
            OpCode::Text | OpCode::Binary => {
                if self.opcode.is_some() {
                    return Err(WebSocketError::InvalidFragment);
                }
                self.opcode = Some(frame.opcode);
            }
            OpCode::Continuation => {
                if self.opcode.is_none() {
                    return Err(WebSocketError::InvalidContinuationFrame);
                }
            }
            _ => unreachable!("control frames are handled by the connection"),
        }

        self.buffer.extend_from_slice(&frame.payload);

        if !frame.fin {
            return Ok(None);
        }

        let opcode = self.opcode.take().expect("message in progress");
        let payload = std::mem::take(&mut self.buffer).freeze();
        let message = match opcode {
            OpCode::Text => {
                let text = String::from_utf8(payload.to_vec())
                    .map_err(|_| WebSocketError::InvalidUTF8)?;
                Message::Text(text)
            }
            _ => Message::Binary(payload),
        };
        Ok(Some(message))
    }
}
