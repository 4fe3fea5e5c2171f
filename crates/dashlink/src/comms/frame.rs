// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Channel frame layout.
//!
//! One logical message is `{ exchanger name, response id, ordered byte
//! segments }`. On the wire that becomes a fixed preamble followed by a
//! length-delimited body:
//!
//! ```text
//! preamble: magic u32 ("DLNK") | body_len u32
//! body:     name_len u32 | name bytes | response_id u64
//!           | segment_count u32 | segment length table (u32 each)
//!           | segment payloads
//! ```
//!
//! All integers little-endian. The preamble makes the body skippable: a body
//! that parses badly is dropped without losing stream synchronization, while
//! a bad magic means the stream itself is corrupt and the channel must fail.

use super::io::{CommsIo, IoError, IoResult};
use crate::constants::{FRAME_MAGIC, MAX_EXCHANGER_NAME, MAX_FRAME_BODY, MAX_FRAME_SEGMENTS};
use crate::wire::{put_string, WireReader};
use bytes::Bytes;

/// One decoded channel message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Name of the exchanger this message belongs to
    pub exchanger: String,
    /// Round-trip correlation id; zero means "no response expected"
    pub response_id: u64,
    /// Ordered opaque payload segments
    pub segments: Vec<Bytes>,
}

/// What the receiver got out of one read cycle.
#[derive(Debug)]
pub enum ReadOutcome {
    /// A well-formed message
    Frame(Frame),
    /// The body was read in full but did not parse; the channel stays alive
    Malformed(String),
}

/// Serialize and write one frame. The caller serializes concurrent writers;
/// a frame must land on the transport contiguously.
pub fn write_frame(
    io: &dyn CommsIo,
    exchanger: &str,
    response_id: u64,
    segments: &[Bytes],
) -> IoResult<()> {
    let body_len = 4
        + exchanger.len()
        + 8
        + 4
        + 4 * segments.len()
        + segments.iter().map(Bytes::len).sum::<usize>();

    let mut head = Vec::with_capacity(8 + body_len - segments.iter().map(Bytes::len).sum::<usize>());
    head.extend_from_slice(&FRAME_MAGIC.to_le_bytes());
    head.extend_from_slice(&(body_len as u32).to_le_bytes());
    put_string(&mut head, exchanger);
    head.extend_from_slice(&response_id.to_le_bytes());
    head.extend_from_slice(&(segments.len() as u32).to_le_bytes());
    for segment in segments {
        head.extend_from_slice(&(segment.len() as u32).to_le_bytes());
    }

    let mut out = Vec::with_capacity(1 + segments.len());
    out.push(Bytes::from(head));
    out.extend(segments.iter().cloned());
    io.write_segments(&out)
}

/// Read one frame, blocking until a full body is available.
///
/// Transport failures come back as `Err`; a body that fails to parse comes
/// back as [`ReadOutcome::Malformed`] so the caller can drop it and continue.
pub fn read_frame(io: &dyn CommsIo) -> IoResult<ReadOutcome> {
    let mut preamble = [0u8; 8];
    io.read_exact(&mut preamble)?;
    let magic = u32::from_le_bytes([preamble[0], preamble[1], preamble[2], preamble[3]]);
    let body_len = u32::from_le_bytes([preamble[4], preamble[5], preamble[6], preamble[7]]) as usize;

    if magic != FRAME_MAGIC {
        // The stream is desynchronized; nothing after this point can be trusted
        return Err(IoError::Failed(format!(
            "bad frame magic 0x{:08X}",
            magic
        )));
    }
    if body_len > MAX_FRAME_BODY {
        return Err(IoError::Failed(format!(
            "declared frame body of {} bytes exceeds the {} byte limit",
            body_len, MAX_FRAME_BODY
        )));
    }

    let mut body = vec![0u8; body_len];
    io.read_exact(&mut body)?;

    Ok(match parse_body(&body) {
        Ok(frame) => ReadOutcome::Frame(frame),
        Err(reason) => ReadOutcome::Malformed(reason),
    })
}

fn parse_body(body: &[u8]) -> Result<Frame, String> {
    let mut reader = WireReader::new(body, "frame body");
    let exchanger = reader
        .read_string(MAX_EXCHANGER_NAME)
        .map_err(|e| e.to_string())?;
    if exchanger.is_empty() {
        return Err("empty exchanger name".to_string());
    }
    let response_id = reader.read_u64().map_err(|e| e.to_string())?;
    let segment_count = reader.read_u32().map_err(|e| e.to_string())? as usize;
    if segment_count > MAX_FRAME_SEGMENTS {
        return Err(format!(
            "{} segments exceeds the {} segment limit",
            segment_count, MAX_FRAME_SEGMENTS
        ));
    }

    let mut lengths = Vec::with_capacity(segment_count);
    for _ in 0..segment_count {
        lengths.push(reader.read_u32().map_err(|e| e.to_string())? as usize);
    }
    if lengths.iter().sum::<usize>() != reader.remaining() {
        return Err(format!(
            "segment lengths total {} but {} body bytes remain",
            lengths.iter().sum::<usize>(),
            reader.remaining()
        ));
    }

    let mut segments = Vec::with_capacity(segment_count);
    for len in lengths {
        let raw = reader.read_bytes(len).map_err(|e| e.to_string())?;
        segments.push(Bytes::copy_from_slice(raw));
    }
    Ok(Frame {
        exchanger,
        response_id,
        segments,
    })
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::comms::LoopbackIo;

    #[test]
    fn test_frame_roundtrip() {
        let (a, b) = LoopbackIo::pair();
        let segments = vec![Bytes::from_static(b"first"), Bytes::from_static(b"second")];
        write_frame(&a, "generic", 42, &segments).unwrap();
        match read_frame(&b).unwrap() {
            ReadOutcome::Frame(frame) => {
                assert_eq!(frame.exchanger, "generic");
                assert_eq!(frame.response_id, 42);
                assert_eq!(frame.segments, segments);
            }
            ReadOutcome::Malformed(reason) => panic!("malformed: {}", reason),
        }
    }

    #[test]
    fn test_empty_segment_list() {
        let (a, b) = LoopbackIo::pair();
        write_frame(&a, "eos", 0, &[]).unwrap();
        match read_frame(&b).unwrap() {
            ReadOutcome::Frame(frame) => {
                assert_eq!(frame.exchanger, "eos");
                assert_eq!(frame.response_id, 0);
                assert!(frame.segments.is_empty());
            }
            ReadOutcome::Malformed(reason) => panic!("malformed: {}", reason),
        }
    }

    #[test]
    fn test_bad_magic_fails_the_stream() {
        let (a, b) = LoopbackIo::pair();
        a.write_all(&[0xFFu8; 8]).unwrap();
        assert!(matches!(read_frame(&b), Err(IoError::Failed(_))));
    }

    #[test]
    fn test_malformed_body_is_dropped_not_fatal() {
        let (a, b) = LoopbackIo::pair();
        // Valid preamble, garbage body: name length larger than the body
        let mut raw = Vec::new();
        raw.extend_from_slice(&FRAME_MAGIC.to_le_bytes());
        raw.extend_from_slice(&8u32.to_le_bytes());
        raw.extend_from_slice(&1000u32.to_le_bytes());
        raw.extend_from_slice(b"abcd");
        a.write_all(&raw).unwrap();
        assert!(matches!(
            read_frame(&b).unwrap(),
            ReadOutcome::Malformed(_)
        ));

        // The stream is still usable afterwards
        write_frame(&a, "ping", 7, &[]).unwrap();
        assert!(matches!(read_frame(&b).unwrap(), ReadOutcome::Frame(_)));
    }
}
