//! WebSocket frames as defined in [RFC 6455 Section 5.2](https://datatracker.ietf.org/doc/html/rfc6455#section-5.2).
//!
//! A frame is the atomic wire unit of the protocol: a small header carrying the
//! FIN flag, the opcode and the payload length, followed by an optional 4-byte
//! masking key and the payload itself.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |         (16 or 64 bits)       |
//! |N|V|V|V|       |S|             |                               |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |                 Masking-key, if MASK set to 1                 |
//! +---------------------------------------------------------------+
//! |                     Payload Data ...                          |
//! +---------------------------------------------------------------+
//! ```
//!
//! Frames come in two categories:
//!
//! - **Data frames** ([`OpCode::Text`], [`OpCode::Binary`],
//!   [`OpCode::Continuation`]) carry application payload and may be fragmented
//!   across several frames.
//! - **Control frames** ([`OpCode::Close`], [`OpCode::Ping`], [`OpCode::Pong`])
//!   manage the connection; they are never fragmented and carry at most 125
//!   payload bytes.
//!
//! # Masking contract
//!
//! A [`Frame`] tracks its masking state through the presence of the key: a
//! stored key means the payload bytes are *currently* masked. [`Frame::mask`]
//! generates a fresh random key and fails with
//! [`WebSocketError::AlreadyMasked`] when the payload is already masked, so a
//! double-masking bug surfaces immediately instead of corrupting the payload.
//! [`Frame::unmask`] is a no-op on an unmasked frame.
use bytes::BytesMut;

use crate::{close::CloseCode, Result, WebSocketError};

/// WebSocket operation code identifying the type of a frame.
///
/// The numeric values are defined in
/// [RFC 6455, Section 11.8](https://datatracker.ietf.org/doc/html/rfc6455#section-11.8):
/// Continuation = 0x0, Text = 0x1, Binary = 0x2, Close = 0x8, Ping = 0x9,
/// Pong = 0xA. The ranges 0x3-0x7 and 0xB-0xF are reserved and rejected
/// during decoding.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    /// Returns `true` for `Close`, `Ping` and `Pong`.
    ///
    /// Control frames must not be fragmented and carry at most 125 payload
    /// bytes; the decoder enforces both constraints.
    pub fn is_control(&self) -> bool {
        matches!(*self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }

    /// Returns `true` for `Text`, `Binary` and `Continuation`.
    pub fn is_data(&self) -> bool {
        !self.is_control()
    }
}

impl TryFrom<u8> for OpCode {
    type Error = WebSocketError;

    /// Interprets the low 4 bits of a frame header. Reserved opcodes produce
    /// [`WebSocketError::InvalidOpCode`].
    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            _ => Err(WebSocketError::InvalidOpCode(value)),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(val: OpCode) -> Self {
        match val {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }
}

/// Maximum encoded size of a frame header: 2 base bytes, up to 8 extended
/// length bytes and a 4-byte masking key.
pub(crate) const MAX_HEAD_SIZE: usize = 14;

/// A single WebSocket frame.
///
/// Frames are transient values: one is built per send call and one per frame
/// read off the wire, they are never shared or persisted. The payload buffer
/// is owned, so masking can mutate it in place.
///
/// The masking key field is private: its presence encodes the masking state of
/// the payload (see the [module docs](self)).
pub struct Frame {
    /// Indicates if this is the final frame in a message.
    pub fin: bool,
    /// The opcode of the frame, defining its type.
    pub opcode: OpCode,
    /// The masking key. `Some` means the payload bytes are currently masked.
    mask: Option<[u8; 4]>,
    /// The payload of the frame, containing the actual data.
    pub payload: BytesMut,
}

impl Frame {
    /// Creates a frame in wire state.
    ///
    /// A provided `mask` key means the payload bytes are already XORed with
    /// it, which is the state the decoder produces. Locally constructed frames
    /// pass `None` and call [`Frame::mask`] later if the role requires it.
    pub fn new(
        fin: bool,
        opcode: OpCode,
        mask: Option<[u8; 4]>,
        payload: impl Into<BytesMut>,
    ) -> Self {
        Self {
            fin,
            opcode,
            mask,
            payload: payload.into(),
        }
    }

    /// Creates a final text frame. The payload is expected to be UTF-8.
    pub fn text(payload: impl Into<BytesMut>) -> Self {
        Self::new(true, OpCode::Text, None, payload)
    }

    /// Creates a final binary frame.
    pub fn binary(payload: impl Into<BytesMut>) -> Self {
        Self::new(true, OpCode::Binary, None, payload)
    }

    /// Creates an empty ping frame.
    pub fn ping() -> Self {
        Self::new(true, OpCode::Ping, None, BytesMut::new())
    }

    /// Creates a ping frame carrying a payload (at most 125 bytes).
    pub fn ping_with(payload: impl Into<BytesMut>) -> Self {
        Self::new(true, OpCode::Ping, None, payload)
    }

    /// Creates a pong frame. Per RFC 6455 the payload must echo the payload of
    /// the ping being answered.
    pub fn pong(payload: impl Into<BytesMut>) -> Self {
        Self::new(true, OpCode::Pong, None, payload)
    }

    /// Creates a close frame carrying a status code and a UTF-8 reason.
    ///
    /// The payload is the 2-byte big-endian status code followed by the
    /// reason bytes.
    pub fn close(code: CloseCode, reason: &str) -> Self {
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.extend_from_slice(&u16::from(code).to_be_bytes());
        payload.extend_from_slice(reason.as_bytes());
        Self::new(true, OpCode::Close, None, payload)
    }

    /// Returns whether the payload is currently masked.
    #[inline(always)]
    pub fn is_masked(&self) -> bool {
        self.mask.is_some()
    }

    /// Returns the masking key, if the frame is masked.
    pub(crate) fn masking_key(&self) -> Option<[u8; 4]> {
        self.mask
    }

    /// Masks the payload in place with a freshly generated random key.
    ///
    /// # Errors
    /// [`WebSocketError::AlreadyMasked`] if the payload is already masked.
    /// Masking twice would corrupt the payload, so the strict contract turns
    /// the bug into an error at the call site.
    pub fn mask(&mut self) -> Result<()> {
        if self.mask.is_some() {
            return Err(WebSocketError::AlreadyMasked);
        }
        let mask: [u8; 4] = rand::random();
        crate::mask::apply_mask(&mut self.payload, mask);
        self.mask = Some(mask);
        Ok(())
    }

    /// Unmasks the payload in place and clears the key. No-op when the frame
    /// is not masked.
    pub fn unmask(&mut self) {
        if let Some(mask) = self.mask.take() {
            crate::mask::apply_mask(&mut self.payload, mask);
        }
    }

    /// Formats the frame header into `head` and returns the number of bytes
    /// written.
    ///
    /// The length field uses the shortest of the three encodings that fits:
    /// 7-bit literal, 16-bit extended or 64-bit extended, always big-endian.
    ///
    /// # Panics
    /// Panics if `head` is shorter than [`MAX_HEAD_SIZE`].
    pub(crate) fn fmt_head(&self, head: &mut [u8]) -> usize {
        head[0] = (self.fin as u8) << 7 | u8::from(self.opcode);

        let len = self.payload.len();
        let size = if len < 126 {
            head[1] = len as u8;
            2
        } else if len <= u16::MAX as usize {
            head[1] = 126;
            head[2..4].copy_from_slice(&(len as u16).to_be_bytes());
            4
        } else {
            head[1] = 127;
            head[2..10].copy_from_slice(&(len as u64).to_be_bytes());
            10
        };

        if let Some(mask) = self.mask {
            head[1] |= 0x80;
            head[size..size + 4].copy_from_slice(&mask);
            size + 4
        } else {
            size
        }
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("fin", &self.fin)
            .field("opcode", &self.opcode)
            .field("masked", &self.is_masked())
            .field("payload_len", &self.payload.len())
            .finish()
    }
}
