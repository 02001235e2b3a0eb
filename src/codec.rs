//! Wire codec for WebSocket frames, built on [`tokio_util::codec`].
//!
//! [`Decoder`] parses untrusted bytes into [`Frame`] values in stages,
//! returning `Ok(None)` until a complete frame is buffered. [`Encoder`]
//! serializes frames back into bytes. [`Codec`] combines both for use with
//! [`tokio_util::codec::Framed`].
//!
//! Extensions are unsupported: any frame with a non-zero RSV bit is rejected
//! with [`WebSocketError::ReservedBitsNotZero`].

use bytes::{Buf, BytesMut};
use tokio_util::codec;

use crate::{
    frame::{Frame, OpCode, MAX_HEAD_SIZE},
    WebSocketError,
};

/// Default cap on a single frame payload: 1 MiB.
pub const MAX_PAYLOAD_READ: usize = 1024 * 1024;

/// Reading state of the decoder across calls.
enum ReadState {
    /// Base header consumed; waiting for the extended length and mask key.
    Header(Header),
    /// Full header consumed; waiting for the payload.
    Payload(HeaderAndMask),
}

/// Fields extracted from the 2-byte base header.
struct Header {
    fin: bool,
    masked: bool,
    opcode: OpCode,
    /// Size of the extended length field (0, 2 or 8 bytes).
    extra: usize,
    /// The raw 7-bit length code.
    length_code: u8,
    /// Bytes still needed before the payload: extended length plus mask key.
    header_size: usize,
}

/// Header plus the decoded mask key and real payload length.
struct HeaderAndMask {
    header: Header,
    mask: Option<[u8; 4]>,
    payload_len: usize,
}

/// Decoder for WebSocket frames.
///
/// Holds the parsing state between calls and enforces the protocol-level
/// guards: zero RSV bits, unfragmented control frames, ping payloads of at
/// most 125 bytes, and a configurable payload size cap.
pub struct Decoder {
    state: Option<ReadState>,
    max_payload_size: usize,
}

impl Decoder {
    /// Creates a decoder that rejects payloads larger than
    /// `max_payload_size` bytes with [`WebSocketError::FrameTooLarge`].
    pub fn new(max_payload_size: usize) -> Self {
        Self {
            state: None,
            max_payload_size,
        }
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new(MAX_PAYLOAD_READ)
    }
}

impl codec::Decoder for Decoder {
    type Item = Frame;
    type Error = WebSocketError;

    /// Decodes one frame, suspending across calls when the buffer holds only
    /// part of it.
    ///
    /// # Returns
    /// - `Ok(Some(Frame))` once a whole frame is available. A masked frame is
    ///   returned still masked, with its key attached.
    /// - `Ok(None)` when more bytes are needed.
    /// - `Err(WebSocketError)` on any protocol violation; the connection is
    ///   not recoverable afterwards.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state.take() {
                None => {
                    if src.remaining() < 2 {
                        return Ok(None);
                    }

                    let fin = src[0] & 0b10000000 != 0;

                    // No extensions are negotiated, so all three RSV bits
                    // must be zero.
                    if src[0] & 0b01110000 != 0 {
                        return Err(WebSocketError::ReservedBitsNotZero);
                    }

                    let opcode = OpCode::try_from(src[0] & 0b00001111)?;
                    let masked = src[1] & 0b10000000 != 0;
                    let length_code = src[1] & 0x7F;

                    let extra = match length_code {
                        126 => 2,
                        127 => 8,
                        _ => 0,
                    };
                    let header_size = extra + masked as usize * 4;
                    src.advance(2);

                    self.state = Some(ReadState::Header(Header {
                        fin,
                        masked,
                        opcode,
                        length_code,
                        extra,
                        header_size,
                    }));
                }
                Some(ReadState::Header(header)) => {
                    if src.remaining() < header.header_size {
                        self.state = Some(ReadState::Header(header));
                        return Ok(None);
                    }

                    let payload_len: usize = match header.extra {
                        0 => usize::from(header.length_code),
                        2 => src.get_u16() as usize,
                        8 => match usize::try_from(src.get_u64()) {
                            Ok(length) => length,
                            Err(_) => return Err(WebSocketError::FrameTooLarge),
                        },
                        _ => unreachable!(),
                    };

                    let mask = if header.masked {
                        Some(src.get_u32().to_be_bytes())
                    } else {
                        None
                    };

                    if header.opcode.is_control() && !header.fin {
                        return Err(WebSocketError::ControlFrameFragmented);
                    }
                    if header.opcode == OpCode::Ping && payload_len > 125 {
                        return Err(WebSocketError::PingFrameTooLarge);
                    }
                    if payload_len >= self.max_payload_size {
                        return Err(WebSocketError::FrameTooLarge);
                    }

                    self.state = Some(ReadState::Payload(HeaderAndMask {
                        header,
                        mask,
                        payload_len,
                    }));
                }
                Some(ReadState::Payload(header_and_mask)) => {
                    if src.remaining() < header_and_mask.payload_len {
                        self.state = Some(ReadState::Payload(header_and_mask));
                        return Ok(None);
                    }

                    let header = header_and_mask.header;
                    let mask = header_and_mask.mask;
                    let payload = src.split_to(header_and_mask.payload_len);

                    break Ok(Some(Frame::new(header.fin, header.opcode, mask, payload)));
                }
            }
        }
    }
}

/// Encoder for WebSocket frames.
///
/// Writes the header produced by [`Frame::fmt_head`] followed by the payload.
/// Masking is the sender's responsibility and happens before encoding.
#[derive(Default)]
pub struct Encoder;

impl codec::Encoder<Frame> for Encoder {
    type Error = WebSocketError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut header = [0; MAX_HEAD_SIZE];
        let size = frame.fmt_head(&mut header[..]);

        dst.reserve(size + frame.payload.len());
        dst.extend_from_slice(&header[..size]);
        dst.extend_from_slice(&frame.payload);

        Ok(())
    }
}

/// Combined frame codec for [`tokio_util::codec::Framed`].
pub struct Codec {
    decoder: Decoder,
    encoder: Encoder,
}

impl Codec {
    /// Creates a codec whose decoder rejects payloads above
    /// `max_payload_size`.
    pub fn new(max_payload_size: usize) -> Self {
        Self {
            decoder: Decoder::new(max_payload_size),
            encoder: Encoder,
        }
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(MAX_PAYLOAD_READ)
    }
}

impl codec::Decoder for Codec {
    type Item = <Decoder as codec::Decoder>::Item;
    type Error = <Decoder as codec::Decoder>::Error;

    #[inline]
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.decoder.decode(src)
    }
}

impl codec::Encoder<Frame> for Codec {
    type Error = <Encoder as codec::Encoder<Frame>>::Error;

    #[inline]
    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.encoder.encode(item, dst)
    }
}
