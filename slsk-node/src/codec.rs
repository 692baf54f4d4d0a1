//! tokio-util framing over the slsk-core frame functions.
//!
//! ```text
//! +-----------+-------------------+-----------+
//! |  Length   |       Code        |  Payload  |
//! | u32 LE    | u8 or u32 LE      |           |
//! +-----------+-------------------+-----------+
//! ```
//!
//! `Length` counts the code and the payload. Peer sockets open with 1-byte codes and switch
//! width once the handshake settles; buffered bytes are decoded with the new width.

use bytes::{Buf, BufMut, BytesMut};
use slsk_core::wire::{self, CodeWidth, Frame, FrameDecodeError, FrameEncodeError, LEN_SIZE};
use tokio_util::codec::{Decoder, Encoder};

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame of {size} bytes exceeds limit of {max}")]
    TooLarge { size: u32, max: u32 },
    #[error(transparent)]
    Encode(#[from] FrameEncodeError),
}

#[derive(Debug, Clone)]
pub struct FrameCodec {
    width: CodeWidth,
    max_len: u32,
}

impl FrameCodec {
    pub fn new(width: CodeWidth) -> Self {
        Self {
            width,
            max_len: wire::MAX_FRAME_LEN,
        }
    }

    /// Codec for the first message on a peer socket.
    pub fn peer_init() -> Self {
        Self::new(CodeWidth::U8)
    }

    pub fn with_max_len(mut self, max_len: u32) -> Self {
        self.max_len = max_len.min(wire::MAX_FRAME_LEN);
        self
    }

    pub fn width(&self) -> CodeWidth {
        self.width
    }

    pub fn set_width(&mut self, width: CodeWidth) {
        self.width = width;
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if src.len() < LEN_SIZE {
                return Ok(None);
            }
            let declared = u32::from_le_bytes([src[0], src[1], src[2], src[3]]);
            if declared > self.max_len {
                return Err(CodecError::TooLarge {
                    size: declared,
                    max: self.max_len,
                });
            }
            match wire::decode_frame(&src[..], self.width) {
                Ok((frame, consumed)) => {
                    src.advance(consumed);
                    return Ok(Some(frame));
                }
                Err(FrameDecodeError::NeedMore) => {
                    src.reserve(LEN_SIZE + declared as usize - src.len());
                    return Ok(None);
                }
                Err(FrameDecodeError::TooLarge(size)) => {
                    return Err(CodecError::TooLarge {
                        size,
                        max: self.max_len,
                    });
                }
                Err(FrameDecodeError::Runt { consumed }) => {
                    // Boundary is known, so skip the runt and keep reading.
                    tracing::debug!(consumed, "skipping runt frame");
                    src.advance(consumed);
                }
            }
        }
    }
}

/// Encode a typed frame.
impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let bytes = wire::encode_frame(self.width, item.code, &item.payload)?;
        dst.put_slice(&bytes);
        Ok(())
    }
}

/// Write a frame already built by a message catalog `to_frame()`.
impl Encoder<Vec<u8>> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Vec<u8>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(item.len());
        dst.put_slice(&item);
        Ok(())
    }
}
