//! Framing: u32 LE length prefix, then a 1- or 4-byte LE code, then payload.
//! Primitive readers never panic: every read is bounds-checked and returns `None` on a short buffer.

use std::net::Ipv4Addr;

use crate::compress::DecompressError;

/// Size of the length prefix in bytes.
pub const LEN_SIZE: usize = 4;
/// Largest frame body we accept from a remote (32 MiB).
pub const MAX_FRAME_LEN: u32 = 32 * 1024 * 1024;

/// Width of the message code that follows the length prefix.
/// Peer-init and distributed messages use one byte; server and peer messages use four.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeWidth {
    U8,
    U32,
}

impl CodeWidth {
    pub fn size(self) -> usize {
        match self {
            CodeWidth::U8 => 1,
            CodeWidth::U32 => 4,
        }
    }
}

/// One framed message: code plus raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub code: u32,
    pub payload: Vec<u8>,
}

/// Encode a frame: 4 bytes LE length (code width + payload), code, payload.
pub fn encode_frame(width: CodeWidth, code: u32, payload: &[u8]) -> Result<Vec<u8>, FrameEncodeError> {
    let body_len = width.size() + payload.len();
    if body_len > MAX_FRAME_LEN as usize {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + body_len);
    out.extend_from_slice(&(body_len as u32).to_le_bytes());
    match width {
        CodeWidth::U8 => out.push(code as u8),
        CodeWidth::U32 => out.extend_from_slice(&code.to_le_bytes()),
    }
    out.extend_from_slice(payload);
    Ok(out)
}

/// Error encoding a message into a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("frame too large")]
    TooLarge,
    #[error("compression failed: {0}")]
    Compress(#[from] std::io::Error),
}

/// Decode one frame from the front of `bytes`. Returns the frame and the number of bytes consumed.
/// Call with a partial buffer; `NeedMore` means try again once more bytes arrived.
pub fn decode_frame(bytes: &[u8], width: CodeWidth) -> Result<(Frame, usize), FrameDecodeError> {
    let Some(len) = read_u32(bytes, 0) else {
        return Err(FrameDecodeError::NeedMore);
    };
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge(len));
    }
    let len = len as usize;
    let total = LEN_SIZE + len;
    if bytes.len() < total {
        return Err(FrameDecodeError::NeedMore);
    }
    if len < width.size() {
        // Boundary is known, so the caller can skip `total` bytes and carry on.
        return Err(FrameDecodeError::Runt { consumed: total });
    }
    let code = match width {
        CodeWidth::U8 => u32::from(bytes[LEN_SIZE]),
        CodeWidth::U32 => read_u32(bytes, LEN_SIZE).ok_or(FrameDecodeError::NeedMore)?,
    };
    let payload = bytes[LEN_SIZE + width.size()..total].to_vec();
    Ok((Frame { code, payload }, total))
}

/// Error decoding a frame.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large: {0} bytes")]
    TooLarge(u32),
    #[error("frame shorter than its code ({consumed} bytes)")]
    Runt { consumed: usize },
}

/// Error parsing a message payload. Parsing stops at the first failure; nothing is retained.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("message truncated while reading {0}")]
    Truncated(&'static str),
    #[error("invalid value for {0}")]
    Invalid(&'static str),
    #[error("unknown message code {0}")]
    UnknownCode(u32),
    #[error("decompression failed: {0}")]
    Decompress(#[from] DecompressError),
}

/// Turn an absent read into a `DecodeError::Truncated` naming the field.
pub trait OrTruncated<T> {
    fn or_truncated(self, field: &'static str) -> Result<T, DecodeError>;
}

impl<T> OrTruncated<T> for Option<T> {
    fn or_truncated(self, field: &'static str) -> Result<T, DecodeError> {
        self.ok_or(DecodeError::Truncated(field))
    }
}

fn read_array<const N: usize>(buf: &[u8], offset: usize) -> Option<[u8; N]> {
    let end = offset.checked_add(N)?;
    buf.get(offset..end)?.try_into().ok()
}

pub fn read_u8(buf: &[u8], offset: usize) -> Option<u8> {
    buf.get(offset).copied()
}

pub fn read_u16(buf: &[u8], offset: usize) -> Option<u16> {
    read_array(buf, offset).map(u16::from_le_bytes)
}

pub fn read_u32(buf: &[u8], offset: usize) -> Option<u32> {
    read_array(buf, offset).map(u32::from_le_bytes)
}

pub fn read_u64(buf: &[u8], offset: usize) -> Option<u64> {
    read_array(buf, offset).map(u64::from_le_bytes)
}

pub fn read_bool(buf: &[u8], offset: usize) -> Option<bool> {
    read_u8(buf, offset).map(|b| b != 0)
}

/// Read a length-prefixed byte string. Returns the bytes and the total consumed (prefix included).
pub fn read_bytes(buf: &[u8], offset: usize) -> Option<(&[u8], usize)> {
    let len = read_u32(buf, offset)? as usize;
    let start = offset.checked_add(LEN_SIZE)?;
    let end = start.checked_add(len)?;
    Some((buf.get(start..end)?, LEN_SIZE + len))
}

/// Read a length-prefixed string. Invalid UTF-8 from legacy clients is replaced, not rejected.
pub fn read_string(buf: &[u8], offset: usize) -> Option<(String, usize)> {
    let (bytes, consumed) = read_bytes(buf, offset)?;
    Some((String::from_utf8_lossy(bytes).into_owned(), consumed))
}

/// Read an IPv4 address carried as a LE u32 whose most significant byte is the first octet.
pub fn read_ip(buf: &[u8], offset: usize) -> Option<Ipv4Addr> {
    let v = read_u32(buf, offset)?;
    Some(Ipv4Addr::new(
        (v >> 24) as u8,
        (v >> 16) as u8,
        (v >> 8) as u8,
        v as u8,
    ))
}

/// Cursor over a message payload.
#[derive(Debug, Clone)]
pub struct MessageReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> MessageReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn advance<T>(&mut self, v: Option<T>, n: usize) -> Option<T> {
        if v.is_some() {
            self.pos += n;
        }
        v
    }

    pub fn read_u8(&mut self) -> Option<u8> {
        let v = read_u8(self.buf, self.pos);
        self.advance(v, 1)
    }

    pub fn read_u16(&mut self) -> Option<u16> {
        let v = read_u16(self.buf, self.pos);
        self.advance(v, 2)
    }

    pub fn read_u32(&mut self) -> Option<u32> {
        let v = read_u32(self.buf, self.pos);
        self.advance(v, 4)
    }

    pub fn read_u64(&mut self) -> Option<u64> {
        let v = read_u64(self.buf, self.pos);
        self.advance(v, 8)
    }

    pub fn read_bool(&mut self) -> Option<bool> {
        let v = read_bool(self.buf, self.pos);
        self.advance(v, 1)
    }

    pub fn read_ip(&mut self) -> Option<Ipv4Addr> {
        let v = read_ip(self.buf, self.pos);
        self.advance(v, 4)
    }

    pub fn read_string(&mut self) -> Option<String> {
        let (s, n) = read_string(self.buf, self.pos)?;
        self.pos += n;
        Some(s)
    }

    pub fn read_bytes(&mut self) -> Option<&'a [u8]> {
        let (b, n) = read_bytes(self.buf, self.pos)?;
        self.pos += n;
        Some(b)
    }

    /// Read a u32 element count, refusing counts the remaining bytes cannot possibly hold.
    /// Keeps a hostile count from driving a huge allocation.
    pub fn read_count(&mut self, min_item_len: usize) -> Option<usize> {
        let start = self.pos;
        let n = self.read_u32()? as usize;
        if n.saturating_mul(min_item_len.max(1)) > self.remaining() {
            self.pos = start;
            return None;
        }
        Some(n)
    }

    /// Everything not yet consumed.
    pub fn rest(&mut self) -> &'a [u8] {
        let rest = self.buf.get(self.pos..).unwrap_or(&[]);
        self.pos = self.buf.len();
        rest
    }
}

/// Builder for a message payload.
#[derive(Debug, Default, Clone)]
pub struct MessageWriter {
    buf: Vec<u8>,
}

impl MessageWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append_u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub fn append_u16(&mut self, v: u16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn append_u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn append_u64(&mut self, v: u64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn append_bool(&mut self, v: bool) -> &mut Self {
        self.append_u8(u8::from(v))
    }

    pub fn append_bytes(&mut self, v: &[u8]) -> &mut Self {
        self.append_u32(v.len() as u32);
        self.buf.extend_from_slice(v);
        self
    }

    pub fn append_string(&mut self, v: &str) -> &mut Self {
        self.append_bytes(v.as_bytes())
    }

    pub fn append_ip(&mut self, ip: Ipv4Addr) -> &mut Self {
        let [a, b, c, d] = ip.octets();
        let v = (u32::from(a) << 24) | (u32::from(b) << 16) | (u32::from(c) << 8) | u32::from(d);
        self.append_u32(v)
    }

    /// Raw bytes with no length prefix.
    pub fn append_raw(&mut self, v: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(v);
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.buf
    }

    pub fn into_frame(self, width: CodeWidth, code: u32) -> Result<Vec<u8>, FrameEncodeError> {
        encode_frame(width, code, &self.buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ip_octets_big_endian_within_le_u32() {
        let mut w = MessageWriter::new();
        w.append_ip(Ipv4Addr::new(10, 20, 30, 40));
        let payload = w.into_payload();
        // LE u32 0x0A141E28
        assert_eq!(payload, vec![0x28, 0x1E, 0x14, 0x0A]);
        let ip = read_ip(&payload, 0).unwrap();
        assert_eq!(ip.to_string(), "10.20.30.40");
    }

    #[test]
    fn string_roundtrip_unicode_and_empty() {
        let mut w = MessageWriter::new();
        w.append_string("").append_string("Björk – Jóga ♫");
        let payload = w.into_payload();
        let mut r = MessageReader::new(&payload);
        assert_eq!(r.read_string().as_deref(), Some(""));
        assert_eq!(r.read_string().as_deref(), Some("Björk – Jóga ♫"));
        assert!(r.is_empty());
    }

    #[test]
    fn short_string_is_absent() {
        let mut payload = 10u32.to_le_bytes().to_vec();
        payload.extend_from_slice(b"abc");
        assert!(read_string(&payload, 0).is_none());
        let mut r = MessageReader::new(&payload);
        assert!(r.read_string().is_none());
        // Failed reads leave the cursor alone.
        assert_eq!(r.position(), 0);
    }

    #[test]
    fn reads_past_end_are_absent() {
        let buf = [1u8, 2, 3];
        assert_eq!(read_u8(&buf, 2), Some(3));
        assert_eq!(read_u8(&buf, 3), None);
        assert_eq!(read_u16(&buf, 2), None);
        assert_eq!(read_u32(&buf, 0), None);
        assert_eq!(read_u64(&buf, usize::MAX), None);
        assert!(read_bytes(&buf, usize::MAX - 1).is_none());
    }

    #[test]
    fn integer_roundtrip_boundaries() {
        let mut w = MessageWriter::new();
        w.append_u8(u8::MAX)
            .append_u16(0xBEEF)
            .append_u32(u32::MAX)
            .append_u64(u64::MAX)
            .append_bool(true)
            .append_bool(false);
        let payload = w.into_payload();
        let mut r = MessageReader::new(&payload);
        assert_eq!(r.read_u8(), Some(u8::MAX));
        assert_eq!(r.read_u16(), Some(0xBEEF));
        assert_eq!(r.read_u32(), Some(u32::MAX));
        assert_eq!(r.read_u64(), Some(u64::MAX));
        assert_eq!(r.read_bool(), Some(true));
        assert_eq!(r.read_bool(), Some(false));
        assert_eq!(r.read_u8(), None);
    }

    #[test]
    fn hostile_count_rejected() {
        let mut w = MessageWriter::new();
        w.append_u32(u32::MAX).append_u32(7);
        let payload = w.into_payload();
        let mut r = MessageReader::new(&payload);
        assert_eq!(r.read_count(4), None);
        assert_eq!(r.position(), 0);
    }

    #[test]
    fn frame_length_invariant() {
        for width in [CodeWidth::U8, CodeWidth::U32] {
            let frame = encode_frame(width, 1, b"hello").unwrap();
            let declared = read_u32(&frame, 0).unwrap() as usize;
            assert_eq!(declared + LEN_SIZE, frame.len());
            assert_eq!(declared, width.size() + 5);
        }
    }

    #[test]
    fn partial_read_need_more() {
        let frame = encode_frame(CodeWidth::U32, 26, b"query").unwrap();
        assert_eq!(
            decode_frame(&frame[..2], CodeWidth::U32),
            Err(FrameDecodeError::NeedMore)
        );
        assert_eq!(
            decode_frame(&frame[..frame.len() - 1], CodeWidth::U32),
            Err(FrameDecodeError::NeedMore)
        );
    }

    #[test]
    fn multiple_frames() {
        let a = encode_frame(CodeWidth::U8, 1, b"abc").unwrap();
        let b = encode_frame(CodeWidth::U8, 0, &7u32.to_le_bytes()).unwrap();
        let mut buf = a.clone();
        buf.extend_from_slice(&b);
        let (f1, n1) = decode_frame(&buf, CodeWidth::U8).unwrap();
        assert_eq!(n1, a.len());
        assert_eq!(f1.code, 1);
        assert_eq!(f1.payload, b"abc");
        let (f2, n2) = decode_frame(&buf[n1..], CodeWidth::U8).unwrap();
        assert_eq!(n2, b.len());
        assert_eq!(f2.code, 0);
    }

    #[test]
    fn oversized_length_rejected() {
        let buf = (MAX_FRAME_LEN + 1).to_le_bytes();
        assert_eq!(
            decode_frame(&buf, CodeWidth::U32),
            Err(FrameDecodeError::TooLarge(MAX_FRAME_LEN + 1))
        );
    }

    #[test]
    fn runt_frame_reports_boundary() {
        let mut buf = 2u32.to_le_bytes().to_vec();
        buf.extend_from_slice(&[9, 9]);
        assert_eq!(
            decode_frame(&buf, CodeWidth::U32),
            Err(FrameDecodeError::Runt { consumed: 6 })
        );
    }
}
