//! Protocol-wide constants.
//!
//! The wire-layout values here are interop-binding: both halves of an
//! offloaded pipeline must agree on them bit-for-bit.

use std::time::Duration;

/// Fixed width of node-kind, instance-name and pad-name fields on the wire.
/// Names must leave room for a terminating zero byte.
pub const NAME_FIELD_LEN: usize = 128;

/// Encoded property values below this size are coalesced into the shared
/// small-property buffer; values at or above it travel as their own segment.
pub const SMALL_PROPERTY_THRESHOLD: usize = 4096;

/// Fixed width of the debug-verbosity string in [`InstanceParams`].
///
/// [`InstanceParams`]: crate::offload::InstanceParams
pub const DEBUG_STRING_LEN: usize = 256;

/// Frame preamble magic ("DLNK").
pub const FRAME_MAGIC: u32 = 0x444C_4E4B;

/// Graph blob header magic ("DLGB").
pub const CODEC_MAGIC: u32 = 0x444C_4742;

/// Graph blob layout version.
pub const CODEC_VERSION: u32 = 1;

/// The channel id that carries the handshake sub-protocols.
pub const DEFAULT_CHANNEL_ID: u32 = 0;

/// Bound on the host's wait for the remote's `ready` message.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on blocking handshake round-trips (params, graph transfer).
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Bound on blocking state-change round-trips.
pub const DEFAULT_STATE_CHANGE_TIMEOUT: Duration = Duration::from_secs(30);

/// Pause between heartbeat probes.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// How long a heartbeat probe may stay unanswered before flatline.
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(15);

/// Upper bound on a frame body; larger declared sizes are protocol errors.
pub const MAX_FRAME_BODY: usize = 256 * 1024 * 1024;

/// Upper bound on segments per frame.
pub const MAX_FRAME_SEGMENTS: usize = 4096;

/// Upper bound on the exchanger-name field in a frame.
pub const MAX_EXCHANGER_NAME: usize = 256;
