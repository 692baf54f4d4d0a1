//! zlib framing for the three large peer replies: 2-byte header, raw DEFLATE, 4-byte Adler-32.
//! Inflation grows its output in steps and stops at a hard ceiling.

use std::io::Write;

use flate2::write::ZlibEncoder;
use flate2::{Compression, Decompress, FlushDecompress, Status};

/// Hard ceiling on inflated size (50 MiB).
pub const MAX_DECOMPRESSED_LEN: usize = 50 * 1024 * 1024;

const MIN_INITIAL_CAPACITY: usize = 64 * 1024;
const INITIAL_RATIO: usize = 20;
const GROWTH_FACTOR: usize = 4;
const HEADER_LEN: usize = 2;
const TRAILER_LEN: usize = 4;
const METHOD_DEFLATE: u8 = 8;

/// Deflate `payload` into a complete zlib stream.
pub fn compress(payload: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(payload.len() / 2 + 16), Compression::default());
    encoder.write_all(payload)?;
    encoder.finish()
}

/// Inflate a zlib stream with the default ceiling.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>, DecompressError> {
    decompress_with_limit(data, MAX_DECOMPRESSED_LEN)
}

/// Inflate a zlib stream, failing once the output would exceed `limit` bytes.
pub fn decompress_with_limit(data: &[u8], limit: usize) -> Result<Vec<u8>, DecompressError> {
    if data.len() < HEADER_LEN + TRAILER_LEN {
        return Err(DecompressError::Truncated);
    }
    let (cmf, flg) = (data[0], data[1]);
    let method = cmf & 0x0f;
    if method != METHOD_DEFLATE {
        return Err(DecompressError::BadMethod(method));
    }
    if (u16::from(cmf) << 8 | u16::from(flg)) % 31 != 0 {
        return Err(DecompressError::BadHeader);
    }
    let deflate = &data[HEADER_LEN..data.len() - TRAILER_LEN];

    let initial = data
        .len()
        .saturating_mul(INITIAL_RATIO)
        .max(MIN_INITIAL_CAPACITY)
        .min(limit.max(1));
    let mut out = Vec::with_capacity(initial);
    let mut inflater = Decompress::new(false);
    loop {
        let in_before = inflater.total_in();
        let out_before = inflater.total_out();
        let offset = usize::try_from(in_before).map_err(|_| DecompressError::Corrupt)?;
        let input = deflate.get(offset..).unwrap_or(&[]);
        let status = inflater
            .decompress_vec(input, &mut out, FlushDecompress::Finish)
            .map_err(|_| DecompressError::Corrupt)?;
        if out.len() > limit {
            return Err(DecompressError::TooLarge { limit });
        }
        if status == Status::StreamEnd {
            return Ok(out);
        }
        if out.len() == out.capacity() {
            if out.len() >= limit {
                return Err(DecompressError::TooLarge { limit });
            }
            let target = out.capacity().saturating_mul(GROWTH_FACTOR).min(limit);
            out.reserve_exact(target.saturating_sub(out.len()).max(1));
            continue;
        }
        let progressed = inflater.total_in() != in_before || inflater.total_out() != out_before;
        if !progressed {
            return Err(DecompressError::Truncated);
        }
    }
}

/// Error inflating a compressed peer reply. Treated as a malformed frame by callers.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum DecompressError {
    #[error("zlib stream truncated")]
    Truncated,
    #[error("unsupported compression method {0}")]
    BadMethod(u8),
    #[error("zlib header check failed")]
    BadHeader,
    #[error("corrupt deflate data")]
    Corrupt,
    #[error("inflated size exceeds {limit} bytes")]
    TooLarge { limit: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_empty_and_single_byte() {
        for payload in [&b""[..], &b"x"[..]] {
            let packed = compress(payload).unwrap();
            assert_eq!(decompress(&packed).unwrap(), payload);
        }
    }

    #[test]
    fn roundtrip_large_needs_growth() {
        // Highly compressible, so the first output estimate is far too small.
        let payload: Vec<u8> = (0..3_000_000u32).map(|i| (i % 7) as u8).collect();
        let packed = compress(&payload).unwrap();
        assert!(packed.len() * INITIAL_RATIO < payload.len());
        assert_eq!(decompress(&packed).unwrap(), payload);
    }

    #[test]
    fn wrong_method_nibble_rejected() {
        let mut packed = compress(b"hello hello hello").unwrap();
        packed[0] = (packed[0] & 0xf0) | 0x07;
        assert_eq!(decompress(&packed), Err(DecompressError::BadMethod(7)));
    }

    #[test]
    fn truncated_stream_is_error() {
        let payload: Vec<u8> = (0..10_000u32).flat_map(|i| i.to_le_bytes()).collect();
        let packed = compress(&payload).unwrap();
        let cut = &packed[..packed.len() / 2];
        assert!(decompress(cut).is_err());
        assert_eq!(decompress(&packed[..3]), Err(DecompressError::Truncated));
    }

    #[test]
    fn garbage_body_is_error() {
        let mut packed = compress(b"some payload worth compressing").unwrap();
        let n = packed.len();
        for b in &mut packed[2..n - 4] {
            *b = 0xff;
        }
        assert!(decompress(&packed).is_err());
    }

    #[test]
    fn ceiling_enforced() {
        let payload = vec![0u8; 1024 * 1024];
        let packed = compress(&payload).unwrap();
        assert_eq!(
            decompress_with_limit(&packed, 4096),
            Err(DecompressError::TooLarge { limit: 4096 })
        );
    }
}
