// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Transport-agnostic multiplexed messaging.
//!
//! This module provides the comms stack of the offload protocol:
//! - [`CommsIo`]: the raw transport contract (loopback and TCP renderings
//!   included)
//! - [`CommsChannel`]: one multiplexed logical connection with a dedicated
//!   receiver thread and request/response correlation
//! - [`Exchanger`]: the closed family of named sub-protocol handlers
//! - [`Response`]: the correlation object blocking round-trips wait on

pub mod channel;
pub mod exchanger;
pub mod frame;
pub mod io;
pub mod loopback;
pub mod response;
pub mod tcp;

pub use channel::{CommsChannel, FailureCallback};
pub use exchanger::{
    EosCallback, ErrorMessageCallback, Exchanger, GenericCallback, GenericVerdict, ReplyPort,
    StateChangeCallback, StateChangeDisposition,
};
pub use frame::{Frame, ReadOutcome};
pub use io::{CommsIo, IoCapabilities, IoError, IoResult};
pub use loopback::LoopbackIo;
pub use response::{Response, ResponseState};
pub use tcp::{tcp_pair, TcpIo};

pub(crate) use exchanger::{
    decode_bool_ack, decode_state_outcome, encode_bool_ack, encode_error_message,
    encode_state_outcome, encode_state_transition, generic_segments,
};
