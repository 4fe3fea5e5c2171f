// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! The lifecycle coordinator: host and remote halves of the offload
//! handshake.
//!
//! Both halves own an insertion-ordered arena of channels keyed by integer
//! channel id; channel 0 ("default") carries the handshake sub-protocols.
//! The host drives READY → PARAMS → GRAPH_TRANSFER → RUN → TEARDOWN; the
//! remote reconstructs the sub-graph and mirrors every lifecycle transition.
//! A comms failure on any channel short-circuits the machine exactly once
//! per instance.

pub mod heartbeat;
pub mod host;
pub mod params;
pub mod remote;

pub use heartbeat::{HeartbeatConfig, HeartbeatMonitor, MonitorState};
pub use host::{OffloadHost, OffloadHostConfig};
pub use params::{InstanceParams, LogMode};
pub use remote::{RemoteInstance, RemoteInstanceConfig};

use crate::comms::{decode_bool_ack, generic_segments, CommsChannel};
use crate::error::Result;
use bytes::Bytes;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Channel arena: insertion-ordered, keyed by out-of-band channel id.
pub type ChannelArena = IndexMap<u32, Arc<CommsChannel>>;

// Exchanger names on the default channel. Part of the wire contract.
pub(crate) const EXCHANGER_GENERIC: &str = "generic";
pub(crate) const EXCHANGER_STATECHANGE: &str = "statechange";
pub(crate) const EXCHANGER_EOS: &str = "eos";
pub(crate) const EXCHANGER_ERROR: &str = "errormessage";
pub(crate) const EXCHANGER_HEARTBEAT: &str = "heartbeat";
pub(crate) const EXCHANGER_PING: &str = "ping";

// Generic transfer-type tags.
pub(crate) const TRANSFER_READY: u32 = 1;
pub(crate) const TRANSFER_PARAMS: u32 = 2;
pub(crate) const TRANSFER_GRAPH: u32 = 3;

/// Send one generic message and block for its boolean ack.
pub(crate) fn send_generic_blocking(
    channel: &CommsChannel,
    tag: u32,
    payload: Vec<Bytes>,
    timeout: Duration,
) -> Result<bool> {
    let reply = channel.send_and_wait(EXCHANGER_GENERIC, generic_segments(tag, payload), timeout)?;
    Ok(decode_bool_ack(&reply))
}

/// Weak references to every channel of one instance, so the failure path can
/// force siblings into error state without keeping them alive.
#[derive(Default)]
pub(crate) struct ChannelHub {
    channels: Mutex<Vec<Weak<CommsChannel>>>,
}

impl ChannelHub {
    pub(crate) fn from_arena(arena: &ChannelArena) -> Arc<Self> {
        let hub = ChannelHub {
            channels: Mutex::new(arena.values().map(Arc::downgrade).collect()),
        };
        Arc::new(hub)
    }

    /// Force every still-live channel into its failed state.
    pub(crate) fn error_all(&self) {
        for weak in self.channels.lock().iter() {
            if let Some(channel) = weak.upgrade() {
                channel.error_state();
            }
        }
    }
}
