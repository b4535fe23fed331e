//! Snapshot framing.
//!
//! Layout: an 8-byte little-endian sentinel, then the payload. A sentinel of
//! `u64::MAX` means the payload is gzip-compressed and is preceded by its
//! 8-byte little-endian compressed size; any other sentinel value *is* the
//! raw payload size and the bytes follow uncompressed.

use std::io::{self, Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

const COMPRESSED_SENTINEL: u64 = u64::MAX;
const HEADER_LEN: usize = 8;

/// Frame database bytes for snapshot transfer. Always compresses.
pub fn encode(raw: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(raw)?;
    let compressed = encoder.finish()?;

    let mut out = Vec::with_capacity(HEADER_LEN * 2 + compressed.len());
    out.extend_from_slice(&COMPRESSED_SENTINEL.to_le_bytes());
    out.extend_from_slice(&(compressed.len() as u64).to_le_bytes());
    out.extend_from_slice(&compressed);
    Ok(out)
}

/// Recover the raw database bytes from a framed snapshot. Accepts both the
/// compressed and the raw form.
pub fn decode(framed: &[u8]) -> io::Result<Vec<u8>> {
    let sentinel = read_u64(framed, 0)?;
    if sentinel == COMPRESSED_SENTINEL {
        let size = read_u64(framed, HEADER_LEN)? as usize;
        let start = HEADER_LEN * 2;
        let end = start
            .checked_add(size)
            .filter(|end| *end <= framed.len())
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::UnexpectedEof, "snapshot truncated")
            })?;
        let mut decoder = GzDecoder::new(&framed[start..end]);
        let mut raw = Vec::new();
        decoder.read_to_end(&mut raw)?;
        Ok(raw)
    } else {
        let size = sentinel as usize;
        let end = HEADER_LEN
            .checked_add(size)
            .filter(|end| *end <= framed.len())
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::UnexpectedEof, "snapshot truncated")
            })?;
        Ok(framed[HEADER_LEN..end].to_vec())
    }
}

fn read_u64(bytes: &[u8], offset: usize) -> io::Result<u64> {
    let end = offset + 8;
    if end > bytes.len() {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "snapshot header truncated",
        ));
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[offset..end]);
    Ok(u64::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let raw = b"sqlite database bytes".repeat(100);
        let framed = encode(&raw).unwrap();
        assert_eq!(decode(&framed).unwrap(), raw);
    }

    #[test]
    fn decodes_raw_form() {
        let raw = b"uncompressed payload".to_vec();
        let mut framed = Vec::new();
        framed.extend_from_slice(&(raw.len() as u64).to_le_bytes());
        framed.extend_from_slice(&raw);
        assert_eq!(decode(&framed).unwrap(), raw);
    }

    #[test]
    fn rejects_truncated_header() {
        assert!(decode(&[1, 2, 3]).is_err());
    }

    #[test]
    fn rejects_truncated_body() {
        let mut framed = Vec::new();
        framed.extend_from_slice(&(1000u64).to_le_bytes());
        framed.extend_from_slice(b"short");
        assert!(decode(&framed).is_err());
    }
}
