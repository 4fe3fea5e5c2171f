// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! The graph codec: a purpose-built binary serializer for one pipeline
//! sub-graph.
//!
//! A serialized graph is a flat list of byte segments:
//!
//! ```text
//! segment 0: header      magic u32 | version u32 | node_count u32
//!                        | pad_count u32 | segment_count u32
//! segment 1: descriptions  element descriptions, then pad descriptions
//! segment 2: small-property buffer (coalesced values below the threshold)
//! segment 3..: one segment per large property value
//! ```
//!
//! Element description: kind and instance name as fixed 128-byte fields,
//! a 1-based element id, then per property a length-prefixed name and a
//! `(location, offset-or-segment, size)` triple locating the bincode-encoded
//! value. Pad description: a fixed 128-byte name, direction, presence, the
//! owning element id, a 1-based pad id, and a tagged link field (internal
//! peer pad id, or an external id naming a boundary pad).
//!
//! Element ids and pad ids are each dense and 1-based within one message;
//! the external-id space is separate from both. The layout is interop-binding
//! and little-endian throughout.

mod decode;
mod encode;

pub use decode::decode_graph;
pub use encode::encode_graph;

use crate::constants::NAME_FIELD_LEN;
use crate::error::{Error, Result};
use crate::graph::PadHandle;
use crate::wire::WireReader;

/// A boundary pad: its peer lies outside the serialized sub-graph and must
/// be wired to an external adapter using an out-of-band channel id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteConnectionCandidate {
    /// External id, 1-based, allocated in pad enumeration order. Identical
    /// between the encode side and the decode side for a given graph.
    pub id: u32,
    /// The boundary pad itself
    pub pad: PadHandle,
}

/// Property value location: coalesced into the shared small-property buffer.
pub(crate) const PROP_LOCATION_SMALL: u32 = 0;
/// Property value location: a standalone segment of its own.
pub(crate) const PROP_LOCATION_SEGMENT: u32 = 1;

/// Link field tag: peer is another serialized pad.
pub(crate) const LINK_INTERNAL: u32 = 1;
/// Link field tag: peer is outside the serialized graph.
pub(crate) const LINK_EXTERNAL: u32 = 2;

/// Index of the small-property buffer in the segment list.
pub(crate) const SMALL_PROP_SEGMENT: usize = 2;
/// Index of the first large-property segment.
pub(crate) const FIRST_LARGE_SEGMENT: usize = 3;

/// Upper bound on a property name.
pub(crate) const MAX_PROPERTY_NAME: usize = 512;

/// Write a fixed-width, zero-padded name field.
pub(crate) fn put_name_field(buf: &mut Vec<u8>, name: &str, what: &str) -> Result<()> {
    if name.len() >= NAME_FIELD_LEN {
        return Err(Error::Serialization(format!(
            "{} '{}' is {} bytes; the fixed name field holds at most {}",
            what,
            name,
            name.len(),
            NAME_FIELD_LEN - 1
        )));
    }
    buf.extend_from_slice(name.as_bytes());
    buf.extend(std::iter::repeat(0u8).take(NAME_FIELD_LEN - name.len()));
    Ok(())
}

/// Read a fixed-width, zero-padded name field.
pub(crate) fn read_name_field(reader: &mut WireReader<'_>, what: &str) -> Result<String> {
    let raw = reader.read_bytes(NAME_FIELD_LEN)?;
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8(raw[..end].to_vec())
        .map_err(|e| Error::Serialization(format!("{} field is not UTF-8: {}", what, e)))
}
