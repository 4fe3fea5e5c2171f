// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! The raw transport contract consumed by [`CommsChannel`].
//!
//! Any endpoint that can move bytes both ways and wake a blocked reader on
//! shutdown satisfies [`CommsIo`]: a kernel channel driver, a TCP socket, or
//! the in-process loopback pair used by tests. The protocol layer above never
//! looks past this trait.
//!
//! [`CommsChannel`]: crate::comms::CommsChannel

use crate::error::Error;
use bytes::Bytes;
use std::fmt;

/// Transport-level failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoError {
    /// The endpoint failed mid-operation
    Failed(String),
    /// The peer (or a local shutdown) closed the connection
    ConnectionClosed,
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoError::Failed(reason) => write!(f, "transport failed: {}", reason),
            IoError::ConnectionClosed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for IoError {}

impl From<IoError> for Error {
    fn from(err: IoError) -> Self {
        match err {
            IoError::Failed(reason) => Error::Transport(reason),
            IoError::ConnectionClosed => Error::ConnectionClosed,
        }
    }
}

/// Result type for transport operations
pub type IoResult<T> = std::result::Result<T, IoError>;

/// Buffer kinds an endpoint prefers to consume and produce.
///
/// Mirrors the capability query of hardware channel drivers; plain byte
/// transports report `"bytes"` on both sides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoCapabilities {
    /// Buffer kinds this endpoint can consume on write
    pub consumable: Vec<String>,
    /// Buffer kinds this endpoint produces on read
    pub producible: Vec<String>,
}

impl Default for IoCapabilities {
    fn default() -> Self {
        Self {
            consumable: vec!["bytes".to_string()],
            producible: vec!["bytes".to_string()],
        }
    }
}

/// One transport endpoint.
///
/// Reads and writes are blocking and complete fully or fail. `shutdown` is
/// idempotent and must cause any read blocked on this endpoint to return
/// [`IoError::ConnectionClosed`], which is what makes channel teardown and
/// failure escalation deadlock-free.
pub trait CommsIo: Send + Sync {
    /// Fill `buf` completely from the transport.
    fn read_exact(&self, buf: &mut [u8]) -> IoResult<()>;

    /// Write all of `buf` to the transport.
    fn write_all(&self, buf: &[u8]) -> IoResult<()>;

    /// Write an ordered list of buffers. The default writes them in sequence;
    /// vectorized transports can override.
    fn write_segments(&self, segments: &[Bytes]) -> IoResult<()> {
        for segment in segments {
            self.write_all(segment)?;
        }
        Ok(())
    }

    /// Close the endpoint. Idempotent; wakes blocked readers.
    fn shutdown(&self);

    /// Preferred buffer kinds.
    fn capabilities(&self) -> IoCapabilities {
        IoCapabilities::default()
    }
}
