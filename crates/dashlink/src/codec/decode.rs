// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Graph decoding.
//!
//! Any failure - unknown node kind, an oversized name, a property range
//! outside its segment, a link to a nonexistent pad id - fails the whole
//! decode with one error. No partial graph is ever exposed.

use super::{
    read_name_field, RemoteConnectionCandidate, FIRST_LARGE_SEGMENT, LINK_EXTERNAL, LINK_INTERNAL,
    MAX_PROPERTY_NAME, PROP_LOCATION_SEGMENT, PROP_LOCATION_SMALL, SMALL_PROP_SEGMENT,
};
use crate::constants::{CODEC_MAGIC, CODEC_VERSION};
use crate::error::{Error, Result};
use crate::graph::{
    Graph, GraphNode, NodeFactory, PadDirection, PadHandle, PadPresence, PropertyValue,
};
use crate::wire::WireReader;
use bytes::Bytes;
use tracing::debug;

struct PadRecord {
    handle: PadHandle,
    direction: PadDirection,
    link_kind: u32,
    link_id: u32,
}

/// Reconstruct a graph from its flat segment representation.
///
/// Node behaviour is supplied by `factory`; a kind the factory does not
/// recognize fails the decode. Returns the graph and its boundary pads in
/// the same shape and order the encode side produced them.
pub fn decode_graph(
    segments: &[Bytes],
    factory: &dyn NodeFactory,
) -> Result<(Graph, Vec<RemoteConnectionCandidate>)> {
    if segments.len() < FIRST_LARGE_SEGMENT {
        return Err(Error::Serialization(format!(
            "graph blob has {} segments; at least {} required",
            segments.len(),
            FIRST_LARGE_SEGMENT
        )));
    }

    // Header
    let mut header = WireReader::new(&segments[0], "graph header");
    let magic = header.read_u32()?;
    if magic != CODEC_MAGIC {
        return Err(Error::Serialization(format!(
            "bad graph magic 0x{:08X}",
            magic
        )));
    }
    let version = header.read_u32()?;
    if version != CODEC_VERSION {
        return Err(Error::Serialization(format!(
            "unsupported graph layout version {}",
            version
        )));
    }
    let node_count = header.read_u32()? as usize;
    let pad_count = header.read_u32()? as usize;
    let segment_count = header.read_u32()? as usize;
    if segment_count != segments.len() {
        return Err(Error::Serialization(format!(
            "header declares {} segments but {} arrived",
            segment_count,
            segments.len()
        )));
    }

    let small_props = &segments[SMALL_PROP_SEGMENT];
    let mut reader = WireReader::new(&segments[1], "graph descriptions");
    let mut graph = Graph::new();

    // Element descriptions
    for element_index in 0..node_count {
        let kind = read_name_field(&mut reader, "node kind")?;
        let name = read_name_field(&mut reader, "instance name")?;
        let id = reader.read_u32()?;
        if id as usize != element_index + 1 {
            return Err(Error::Serialization(format!(
                "element id {} out of sequence (expected {})",
                id,
                element_index + 1
            )));
        }

        let behaviour = factory.create(&kind, &name).ok_or_else(|| {
            Error::Serialization(format!("unknown node kind '{}' for node '{}'", kind, name))
        })?;
        let mut node = GraphNode::new(kind, name).with_behaviour(behaviour);

        let property_count = reader.read_u32()? as usize;
        for _ in 0..property_count {
            let prop_name = reader.read_string(MAX_PROPERTY_NAME)?;
            let location = reader.read_u32()?;
            let place = reader.read_u32()? as usize;
            let size = reader.read_u32()? as usize;

            let raw = match location {
                PROP_LOCATION_SMALL => {
                    let end = place.checked_add(size).ok_or_else(|| {
                        Error::Serialization(format!(
                            "property '{}' range overflows",
                            prop_name
                        ))
                    })?;
                    if end > small_props.len() {
                        return Err(Error::Serialization(format!(
                            "property '{}' range {}..{} is outside the {} byte small-property buffer",
                            prop_name,
                            place,
                            end,
                            small_props.len()
                        )));
                    }
                    small_props.slice(place..end)
                }
                PROP_LOCATION_SEGMENT => {
                    if place < FIRST_LARGE_SEGMENT || place >= segments.len() {
                        return Err(Error::Serialization(format!(
                            "property '{}' names segment {} of {}",
                            prop_name,
                            place,
                            segments.len()
                        )));
                    }
                    let segment = &segments[place];
                    if size > segment.len() {
                        return Err(Error::Serialization(format!(
                            "property '{}' wants {} bytes from a {} byte segment",
                            prop_name,
                            size,
                            segment.len()
                        )));
                    }
                    // The whole-segment case is the common one and stays
                    // zero-copy; a shorter declared size takes a prefix slice
                    segment.slice(0..size)
                }
                other => {
                    return Err(Error::Serialization(format!(
                        "property '{}' has unknown location tag {}",
                        prop_name, other
                    )));
                }
            };

            let value: PropertyValue = bincode::deserialize(&raw)?;
            node.set_property(prop_name, value);
        }

        graph.add_node(node);
    }

    // Pad descriptions
    let mut records = Vec::with_capacity(pad_count);
    for pad_index in 0..pad_count {
        let pad_name = read_name_field(&mut reader, "pad name")?;
        let direction = PadDirection::from_code(reader.read_u32()?)
            .ok_or_else(|| Error::Serialization(format!("bad direction on pad '{}'", pad_name)))?;
        let presence = PadPresence::from_code(reader.read_u32()?)
            .ok_or_else(|| Error::Serialization(format!("bad presence on pad '{}'", pad_name)))?;
        let owner = reader.read_u32()? as usize;
        if owner == 0 || owner > node_count {
            return Err(Error::Serialization(format!(
                "pad '{}' owned by nonexistent element {}",
                pad_name, owner
            )));
        }
        let id = reader.read_u32()?;
        if id as usize != pad_index + 1 {
            return Err(Error::Serialization(format!(
                "pad id {} out of sequence (expected {})",
                id,
                pad_index + 1
            )));
        }
        let link_kind = reader.read_u32()?;
        let link_id = reader.read_u32()?;

        let node_index = owner - 1;
        let pad_in_node = graph
            .node_mut(node_index)
            .ok_or_else(|| Error::Serialization(format!("element {} vanished", owner)))?
            .add_pad(pad_name, direction, presence);
        records.push(PadRecord {
            handle: PadHandle {
                node: node_index,
                pad: pad_in_node,
            },
            direction,
            link_kind,
            link_id,
        });
    }

    if reader.remaining() != 0 {
        return Err(Error::Serialization(format!(
            "{} trailing bytes after graph descriptions",
            reader.remaining()
        )));
    }

    // Link resolution. Internal links are declared from both endpoints but
    // applied once, from the source-typed side.
    let mut candidates = Vec::new();
    for (record_index, record) in records.iter().enumerate() {
        match record.link_kind {
            LINK_INTERNAL => {
                let peer_index = record.link_id as usize;
                if peer_index == 0 || peer_index > records.len() {
                    return Err(Error::Serialization(format!(
                        "pad id {} links to nonexistent pad id {}",
                        record_index + 1,
                        record.link_id
                    )));
                }
                if record.direction == PadDirection::Source {
                    let peer = records[peer_index - 1].handle;
                    graph
                        .link(record.handle, peer)
                        .map_err(|e| Error::Serialization(e.to_string()))?;
                }
            }
            LINK_EXTERNAL => {
                graph
                    .mark_external(record.handle)
                    .map_err(|e| Error::Serialization(e.to_string()))?;
                candidates.push(RemoteConnectionCandidate {
                    id: record.link_id,
                    pad: record.handle,
                });
            }
            other => {
                return Err(Error::Serialization(format!(
                    "unknown pad link tag {}",
                    other
                )));
            }
        }
    }

    debug!(
        nodes = node_count,
        pads = pad_count,
        boundary = candidates.len(),
        "decoded graph"
    );
    Ok((graph, candidates))
}
