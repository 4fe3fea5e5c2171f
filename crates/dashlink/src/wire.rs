//! Checked little-endian readers shared by the frame layer and the graph
//! codec. Every read is bounds-checked so a truncated or hostile buffer
//! surfaces as an error instead of a panic.

use crate::error::{Error, Result};
use bytes::Bytes;

/// A bounds-checked cursor over one byte buffer.
#[derive(Debug)]
pub(crate) struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
    /// Context string used in error messages ("frame body", "graph blob", ...)
    what: &'static str,
}

impl<'a> WireReader<'a> {
    pub(crate) fn new(buf: &'a [u8], what: &'static str) -> Self {
        Self { buf, pos: 0, what }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(Error::Protocol(format!(
                "truncated {}: wanted {} bytes at offset {}, {} remain",
                self.what,
                len,
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub(crate) fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        let mut raw = [0u8; 4];
        raw.copy_from_slice(bytes);
        Ok(u32::from_le_bytes(raw))
    }

    pub(crate) fn read_u64(&mut self) -> Result<u64> {
        let bytes = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(raw))
    }

    pub(crate) fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        self.take(len)
    }

    /// Read a u32 length followed by that many bytes, interpreted as UTF-8.
    pub(crate) fn read_string(&mut self, max_len: usize) -> Result<String> {
        let len = self.read_u32()? as usize;
        if len > max_len {
            return Err(Error::Protocol(format!(
                "string of {} bytes in {} exceeds the {} byte limit",
                len, self.what, max_len
            )));
        }
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|e| Error::Protocol(format!("invalid UTF-8 in {}: {}", self.what, e)))
    }
}

/// Append a u32 length prefix and the string bytes.
pub(crate) fn put_string(buf: &mut Vec<u8>, value: &str) {
    buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
    buf.extend_from_slice(value.as_bytes());
}

/// Concatenate message segments into one reply payload. Single-segment
/// replies are passed through without a copy.
pub(crate) fn concat_segments(mut segments: Vec<Bytes>) -> Bytes {
    match segments.len() {
        0 => Bytes::new(),
        1 => segments.remove(0),
        _ => {
            let total = segments.iter().map(Bytes::len).sum();
            let mut out = Vec::with_capacity(total);
            for segment in &segments {
                out.extend_from_slice(segment);
            }
            Bytes::from(out)
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_integers() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&7u32.to_le_bytes());
        buf.extend_from_slice(&0xDEAD_BEEF_u64.to_le_bytes());
        let mut reader = WireReader::new(&buf, "test");
        assert_eq!(reader.read_u32().unwrap(), 7);
        assert_eq!(reader.read_u64().unwrap(), 0xDEAD_BEEF);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_truncated_read_is_an_error() {
        let buf = [1u8, 2];
        let mut reader = WireReader::new(&buf, "test");
        let err = reader.read_u32().unwrap_err();
        assert!(err.to_string().contains("truncated test"));
    }

    #[test]
    fn test_string_roundtrip() {
        let mut buf = Vec::new();
        put_string(&mut buf, "statechange");
        let mut reader = WireReader::new(&buf, "test");
        assert_eq!(reader.read_string(64).unwrap(), "statechange");
    }

    #[test]
    fn test_string_limit_enforced() {
        let mut buf = Vec::new();
        put_string(&mut buf, "0123456789");
        let mut reader = WireReader::new(&buf, "test");
        assert!(reader.read_string(4).is_err());
    }

    #[test]
    fn test_concat_segments_passthrough_and_copy() {
        let single = concat_segments(vec![Bytes::from_static(b"abc")]);
        assert_eq!(&single[..], b"abc");
        let joined = concat_segments(vec![Bytes::from_static(b"ab"), Bytes::from_static(b"cd")]);
        assert_eq!(&joined[..], b"abcd");
    }
}
