// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Error types for dashlink
//!
//! One crate-level error enum covering the protocol taxonomy: transport
//! failures, protocol violations, handshake timeouts, serialization failures,
//! and the instance-wide fatal comms escalation.

use std::time::Duration;
use thiserror::Error;

/// Result type for dashlink operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while offloading a pipeline sub-graph
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Transport send/receive failure
    #[error("transport error: {0}")]
    Transport(String),

    /// The underlying connection was closed
    #[error("connection closed")]
    ConnectionClosed,

    /// Malformed frame, unknown exchanger, or an id out of range
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A bounded handshake wait was exceeded
    #[error("handshake step '{step}' timed out after {timeout:?}")]
    HandshakeTimeout {
        /// Which handshake step timed out
        step: String,
        /// The bound that was exceeded
        timeout: Duration,
    },

    /// Graph encode/decode failure
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The remote half reported a failure for a handshake step
    #[error("remote failure: {0}")]
    RemoteFailure(String),

    /// Escalated, instance-wide comms failure (reported once per instance)
    #[error("fatal comms failure: {0}")]
    FatalComms(String),

    /// Invalid graph topology operation
    #[error("graph error: {0}")]
    Graph(String),
}

impl Error {
    /// Check if this error terminates the whole instance.
    ///
    /// Protocol errors and single-exchanger failures are recovered locally;
    /// everything that reaches the embedding application through this variant
    /// set is either step-fatal (timeout, serialization) or instance-fatal.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::ConnectionClosed | Error::FatalComms(_)
        )
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Transport(err.to_string())
    }
}
