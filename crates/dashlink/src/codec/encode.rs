//! Graph encoding.

use super::{
    put_name_field, RemoteConnectionCandidate, FIRST_LARGE_SEGMENT, LINK_EXTERNAL, LINK_INTERNAL,
    MAX_PROPERTY_NAME, PROP_LOCATION_SEGMENT, PROP_LOCATION_SMALL,
};
use crate::constants::{CODEC_MAGIC, CODEC_VERSION, SMALL_PROPERTY_THRESHOLD};
use crate::error::{Error, Result};
use crate::graph::{Graph, PadHandle, PadLink};
use crate::wire::put_string;
use bytes::Bytes;
use indexmap::IndexMap;
use tracing::debug;

/// Serialize a graph into its flat segment representation.
///
/// Returns the segments and the list of boundary pads whose peers must be
/// wired externally. The candidate list is in pad enumeration order; its
/// length always matches what the peer's decode reports for the same graph.
pub fn encode_graph(graph: &Graph) -> Result<(Vec<Bytes>, Vec<RemoteConnectionCandidate>)> {
    // Pass 1: stable pad enumeration and 1-based id assignment
    let handles = graph.linked_pads();
    let mut pad_ids: IndexMap<PadHandle, u32> = IndexMap::new();
    for (index, handle) in handles.iter().enumerate() {
        pad_ids.insert(*handle, index as u32 + 1);
    }

    let mut descriptions = Vec::new();
    let mut small_props = Vec::new();
    let mut large_segments: Vec<Bytes> = Vec::new();

    // Element descriptions
    for (node_index, node) in graph.nodes().iter().enumerate() {
        put_name_field(&mut descriptions, node.kind(), "node kind")?;
        put_name_field(&mut descriptions, node.name(), "instance name")?;
        descriptions.extend_from_slice(&(node_index as u32 + 1).to_le_bytes());
        descriptions.extend_from_slice(&(node.properties().len() as u32).to_le_bytes());

        for (prop_name, value) in node.properties() {
            if prop_name.len() > MAX_PROPERTY_NAME {
                return Err(Error::Serialization(format!(
                    "property name '{}' on node '{}' is too long",
                    prop_name,
                    node.name()
                )));
            }
            let encoded = bincode::serialize(value)?;
            put_string(&mut descriptions, prop_name);
            if encoded.len() < SMALL_PROPERTY_THRESHOLD {
                descriptions.extend_from_slice(&PROP_LOCATION_SMALL.to_le_bytes());
                descriptions.extend_from_slice(&(small_props.len() as u32).to_le_bytes());
                descriptions.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
                small_props.extend_from_slice(&encoded);
            } else {
                let segment_index = FIRST_LARGE_SEGMENT + large_segments.len();
                descriptions.extend_from_slice(&PROP_LOCATION_SEGMENT.to_le_bytes());
                descriptions.extend_from_slice(&(segment_index as u32).to_le_bytes());
                descriptions.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
                large_segments.push(Bytes::from(encoded));
            }
        }
    }

    // Pad descriptions and boundary resolution
    let mut candidates = Vec::new();
    let mut next_external_id: u32 = 1;
    for handle in &handles {
        let node = graph
            .node(handle.node)
            .ok_or_else(|| Error::Serialization(format!("pad {:?} has no owner", handle)))?;
        let pad = graph
            .pad(*handle)
            .ok_or_else(|| Error::Serialization(format!("pad {:?} vanished", handle)))?;

        put_name_field(&mut descriptions, pad.name(), "pad name")?;
        descriptions.extend_from_slice(&pad.direction().code().to_le_bytes());
        descriptions.extend_from_slice(&pad.presence().code().to_le_bytes());
        descriptions.extend_from_slice(&(handle.node as u32 + 1).to_le_bytes());
        let pad_id = pad_ids
            .get(handle)
            .copied()
            .ok_or_else(|| Error::Serialization(format!("pad {:?} missing from id map", handle)))?;
        descriptions.extend_from_slice(&pad_id.to_le_bytes());

        match pad.link() {
            PadLink::Internal(peer) => {
                // Resolved from both endpoints; the decode side links once,
                // from the source-typed side
                let peer_id = pad_ids.get(&peer).copied().ok_or_else(|| {
                    Error::Serialization(format!(
                        "pad {}:{} links to a pad outside the enumeration",
                        node.name(),
                        pad.name()
                    ))
                })?;
                descriptions.extend_from_slice(&LINK_INTERNAL.to_le_bytes());
                descriptions.extend_from_slice(&peer_id.to_le_bytes());
            }
            PadLink::External => {
                let id = next_external_id;
                next_external_id += 1;
                candidates.push(RemoteConnectionCandidate { id, pad: *handle });
                descriptions.extend_from_slice(&LINK_EXTERNAL.to_le_bytes());
                descriptions.extend_from_slice(&id.to_le_bytes());
            }
            PadLink::Unlinked => {
                // linked_pads() never yields these
                return Err(Error::Serialization(format!(
                    "unlinked pad {:?} in enumeration",
                    handle
                )));
            }
        }
    }

    let segment_count = FIRST_LARGE_SEGMENT + large_segments.len();
    let mut header = Vec::with_capacity(20);
    header.extend_from_slice(&CODEC_MAGIC.to_le_bytes());
    header.extend_from_slice(&CODEC_VERSION.to_le_bytes());
    header.extend_from_slice(&(graph.node_count() as u32).to_le_bytes());
    header.extend_from_slice(&(handles.len() as u32).to_le_bytes());
    header.extend_from_slice(&(segment_count as u32).to_le_bytes());

    let mut segments = Vec::with_capacity(segment_count);
    segments.push(Bytes::from(header));
    segments.push(Bytes::from(descriptions));
    segments.push(Bytes::from(small_props));
    segments.extend(large_segments);

    debug!(
        nodes = graph.node_count(),
        pads = handles.len(),
        boundary = candidates.len(),
        segments = segments.len(),
        "encoded graph"
    );
    Ok((segments, candidates))
}
