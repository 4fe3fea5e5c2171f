// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)
// DashLink - Remote Offload Protocol for Pipeline Graphs

//! # DashLink
//!
//! Split a processing graph across two cooperating processes: a local half
//! that keeps the original topology, and a remote half that reconstructs an
//! offloaded sub-graph and runs it to completion, with both halves kept in
//! lock-step through an explicit handshake over an arbitrary byte transport.
//!
//! ## Layers
//!
//! - **[`comms`]**: a transport-agnostic multiplexed channel carrying
//!   independent sub-protocols ("exchangers") over one connection, with
//!   request/response correlation and an idempotent failure path
//! - **[`codec`]**: a purpose-built binary serializer turning a sub-graph
//!   (nodes, typed properties, internal links, boundary pads) into a flat
//!   segment list and back
//! - **[`offload`]**: the lifecycle coordinator - host and remote halves of
//!   the readiness/params/graph-transfer/state-change/EOS/teardown machine,
//!   plus the heartbeat liveness monitor
//! - **[`graph`]**: the pipeline-graph contract the protocol operates on;
//!   node behaviour itself is supplied by the embedding runtime
//!
//! ## Example
//!
//! ```rust,no_run
//! use dashlink::comms::{CommsChannel, LoopbackIo};
//! use dashlink::graph::{Graph, GraphNode, PadDirection, PadPresence, PropertyValue};
//! use dashlink::offload::{ChannelArena, InstanceParams, OffloadHost, OffloadHostConfig};
//! use std::sync::Arc;
//!
//! # fn main() -> dashlink::Result<()> {
//! let (host_io, _remote_io) = LoopbackIo::pair();
//! let mut arena = ChannelArena::new();
//! arena.insert(0, Arc::new(CommsChannel::new("default", Arc::new(host_io))));
//! let host = OffloadHost::new(arena, OffloadHostConfig::default())?;
//!
//! let mut graph = Graph::new();
//! let node = graph.add_node(
//!     GraphNode::new("videoconvert", "convert0")
//!         .with_property("passthrough", PropertyValue::Bool(false))
//!         .with_pad("sink", PadDirection::Sink, PadPresence::Always),
//! );
//! graph.mark_external(dashlink::graph::PadHandle { node, pad: 0 })?;
//!
//! host.wait_remote_ready()?;
//! host.send_params(&InstanceParams::default())?;
//! let boundary = host.transfer_graph(&graph)?;
//! # let _ = boundary;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod comms;
pub mod constants;
pub mod error;
pub mod graph;
pub mod offload;

pub(crate) mod wire;

pub use codec::{decode_graph, encode_graph, RemoteConnectionCandidate};
pub use comms::{CommsChannel, CommsIo, Exchanger, LoopbackIo, Response, ResponseState, TcpIo};
pub use error::{Error, Result};
pub use graph::{Graph, GraphNode, NodeFactory, NodeState, StateChangeOutcome, StateTransition};
pub use offload::{
    ChannelArena, HeartbeatConfig, HeartbeatMonitor, InstanceParams, MonitorState, OffloadHost,
    OffloadHostConfig, RemoteInstance, RemoteInstanceConfig,
};
