// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! The exchanger family: small stateless sub-protocol adapters multiplexed
//! over one channel.
//!
//! An exchanger is registered on a channel under a name and receives every
//! message addressed to that name on the channel's receiver thread. Callbacks
//! must not block; anything that takes real work is handed off (see
//! [`GenericVerdict::Deferred`]) and answered later with the stored
//! response id.
//!
//! Dispatch is a closed enum matched exhaustively - the sub-protocol set is
//! part of the wire contract, not an extension point.

use crate::error::{Error, Result};
use crate::graph::{StateChangeOutcome, StateTransition};
use bytes::Bytes;
use tracing::warn;

/// Something an exchanger can answer through. Implemented by the channel
/// core; kept as a trait so exchangers stay testable in isolation.
pub trait ReplyPort {
    /// Send a reply frame carrying `response_id` back to the requester.
    fn reply(&self, exchanger: &str, segments: Vec<Bytes>, response_id: u64);
}

/// What a generic-exchanger callback decided about a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenericVerdict {
    /// Nothing to send back
    Ignored,
    /// Acknowledge immediately with a boolean
    Ack(bool),
    /// The work was handed off; the component answers later with the
    /// stored response id
    Deferred,
}

/// What a state-change callback decided about a transition request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateChangeDisposition {
    /// Answer immediately with a transition result
    Reply(StateChangeOutcome),
    /// The transition was queued for the run loop; it answers later
    Deferred,
}

/// Callback fired when a remote EOS notification arrives.
pub type EosCallback = Box<dyn Fn() + Send + Sync>;
/// Callback receiving a forwarded error message; ownership of the string
/// passes to the callback.
pub type ErrorMessageCallback = Box<dyn Fn(String) + Send + Sync>;
/// Callback receiving a generic message: transfer tag, opaque segments, and
/// the response id (zero when no response was requested).
pub type GenericCallback = Box<dyn Fn(u32, Vec<Bytes>, u64) -> GenericVerdict + Send + Sync>;
/// Callback receiving a state-change request with its response id.
pub type StateChangeCallback =
    Box<dyn Fn(StateTransition, u64) -> StateChangeDisposition + Send + Sync>;

/// One named sub-protocol handler.
pub enum Exchanger {
    /// Applies a lifecycle transition and answers with a transition result
    StateChange(StateChangeCallback),
    /// Forwards a NUL-terminated error string to a local callback
    ErrorMessage(ErrorMessageCallback),
    /// Signals end-of-stream; acks when a response is requested
    Eos(EosCallback),
    /// Trivial echo
    Ping,
    /// Liveness probe target; always acks
    Heartbeat,
    /// Tagged opaque transfer with an optional blocking boolean ack
    Generic(GenericCallback),
}

impl Exchanger {
    /// Variant name for logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Exchanger::StateChange(_) => "statechange",
            Exchanger::ErrorMessage(_) => "errormessage",
            Exchanger::Eos(_) => "eos",
            Exchanger::Ping => "ping",
            Exchanger::Heartbeat => "heartbeat",
            Exchanger::Generic(_) => "generic",
        }
    }

    /// Dispatch one received message. Runs on the channel's receiver thread.
    pub(crate) fn received(
        &self,
        name: &str,
        segments: Vec<Bytes>,
        response_id: u64,
        port: &dyn ReplyPort,
    ) {
        match self {
            Exchanger::Eos(callback) => {
                if response_id != 0 {
                    port.reply(name, Vec::new(), response_id);
                }
                callback();
            }
            Exchanger::ErrorMessage(callback) => match decode_error_message(&segments) {
                Ok(message) => callback(message),
                Err(err) => warn!(exchanger = name, %err, "dropped malformed error message"),
            },
            Exchanger::Ping | Exchanger::Heartbeat => {
                if response_id != 0 {
                    port.reply(name, Vec::new(), response_id);
                }
            }
            Exchanger::Generic(callback) => {
                let Some((tag, rest)) = split_generic(&segments) else {
                    warn!(exchanger = name, "dropped generic message without a tag");
                    return;
                };
                match callback(tag, rest, response_id) {
                    GenericVerdict::Ack(ok) => {
                        if response_id != 0 {
                            port.reply(name, vec![encode_bool_ack(ok)], response_id);
                        }
                    }
                    GenericVerdict::Ignored | GenericVerdict::Deferred => {}
                }
            }
            Exchanger::StateChange(callback) => {
                let transition = match decode_state_transition(&segments) {
                    Ok(transition) => transition,
                    Err(err) => {
                        warn!(exchanger = name, %err, "dropped malformed state change");
                        return;
                    }
                };
                match callback(transition, response_id) {
                    StateChangeDisposition::Reply(outcome) => {
                        if response_id != 0 {
                            port.reply(name, vec![encode_state_outcome(outcome)], response_id);
                        }
                    }
                    StateChangeDisposition::Deferred => {}
                }
            }
        }
    }
}

impl std::fmt::Debug for Exchanger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Exchanger").field(&self.kind()).finish()
    }
}

// ============================================================================
// Payload encodings
// ============================================================================

/// Boolean ack payload: a single byte.
pub(crate) fn encode_bool_ack(ok: bool) -> Bytes {
    Bytes::copy_from_slice(&[u8::from(ok)])
}

/// Read a boolean ack payload.
pub(crate) fn decode_bool_ack(payload: &[u8]) -> bool {
    payload.first() == Some(&1)
}

/// State transition request payload: one u32 transition code.
pub(crate) fn encode_state_transition(transition: StateTransition) -> Bytes {
    Bytes::copy_from_slice(&transition.code().to_le_bytes())
}

fn decode_state_transition(segments: &[Bytes]) -> Result<StateTransition> {
    let payload = segments
        .first()
        .ok_or_else(|| Error::Protocol("state change without a payload".to_string()))?;
    if payload.len() < 4 {
        return Err(Error::Protocol("state change payload too short".to_string()));
    }
    let code = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
    StateTransition::from_code(code)
        .ok_or_else(|| Error::Protocol(format!("unknown state transition code {}", code)))
}

/// State transition reply payload: one u32 outcome code.
pub(crate) fn encode_state_outcome(outcome: StateChangeOutcome) -> Bytes {
    Bytes::copy_from_slice(&outcome.code().to_le_bytes())
}

/// Read a state transition reply payload.
pub(crate) fn decode_state_outcome(payload: &[u8]) -> Result<StateChangeOutcome> {
    if payload.len() < 4 {
        return Err(Error::Protocol(
            "state change reply payload too short".to_string(),
        ));
    }
    let code = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
    StateChangeOutcome::from_code(code)
        .ok_or_else(|| Error::Protocol(format!("unknown state outcome code {}", code)))
}

/// Error message payload: NUL-terminated UTF-8.
pub(crate) fn encode_error_message(message: &str) -> Bytes {
    let mut raw = Vec::with_capacity(message.len() + 1);
    raw.extend_from_slice(message.as_bytes());
    raw.push(0);
    Bytes::from(raw)
}

fn decode_error_message(segments: &[Bytes]) -> Result<String> {
    let payload = segments
        .first()
        .ok_or_else(|| Error::Protocol("error message without a payload".to_string()))?;
    let end = payload
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| Error::Protocol("error message is not NUL-terminated".to_string()))?;
    String::from_utf8(payload[..end].to_vec())
        .map_err(|e| Error::Protocol(format!("error message is not UTF-8: {}", e)))
}

/// Split a generic payload into its 4-byte transfer tag and the remaining
/// opaque segments.
fn split_generic(segments: &[Bytes]) -> Option<(u32, Vec<Bytes>)> {
    let head = segments.first()?;
    if head.len() < 4 {
        return None;
    }
    let tag = u32::from_le_bytes([head[0], head[1], head[2], head[3]]);
    Some((tag, segments[1..].to_vec()))
}

/// Build the segment list for a generic message: the tag segment followed by
/// the opaque payload segments.
pub(crate) fn generic_segments(tag: u32, payload: Vec<Bytes>) -> Vec<Bytes> {
    let mut segments = Vec::with_capacity(payload.len() + 1);
    segments.push(Bytes::copy_from_slice(&tag.to_le_bytes()));
    segments.extend(payload);
    segments
}
