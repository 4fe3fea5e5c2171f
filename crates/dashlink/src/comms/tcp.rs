//! TCP rendering of the [`CommsIo`] contract.
//!
//! A thin blocking wrapper: one cloned stream per direction so reads and
//! writes never contend, plus a third handle reserved for shutdown so a
//! blocked reader can always be woken.

use super::io::{CommsIo, IoError, IoResult};
use crate::error::Result;
use parking_lot::Mutex;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream, ToSocketAddrs};
use tracing::debug;

/// A connected TCP transport endpoint.
pub struct TcpIo {
    reader: Mutex<TcpStream>,
    writer: Mutex<TcpStream>,
    shutdown_handle: TcpStream,
}

impl TcpIo {
    /// Wrap an already-connected stream.
    pub fn from_stream(stream: TcpStream) -> Result<Self> {
        stream.set_nodelay(true)?;
        let reader = stream.try_clone()?;
        let writer = stream.try_clone()?;
        Ok(Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            shutdown_handle: stream,
        })
    }

    /// Connect to a listening peer.
    pub fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        debug!(peer = ?stream.peer_addr().ok(), "tcp transport connected");
        Self::from_stream(stream)
    }

    /// Accept one connection from a listener.
    pub fn accept(listener: &TcpListener) -> Result<Self> {
        let (stream, peer) = listener.accept()?;
        debug!(%peer, "tcp transport accepted");
        Self::from_stream(stream)
    }
}

fn map_io_error(err: std::io::Error) -> IoError {
    match err.kind() {
        std::io::ErrorKind::UnexpectedEof
        | std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::ConnectionAborted
        | std::io::ErrorKind::BrokenPipe
        | std::io::ErrorKind::NotConnected => IoError::ConnectionClosed,
        _ => IoError::Failed(err.to_string()),
    }
}

impl CommsIo for TcpIo {
    fn read_exact(&self, buf: &mut [u8]) -> IoResult<()> {
        let mut stream = self.reader.lock();
        stream.read_exact(buf).map_err(map_io_error)?;
        Ok(())
    }

    fn write_all(&self, buf: &[u8]) -> IoResult<()> {
        let mut stream = self.writer.lock();
        stream.write_all(buf).map_err(map_io_error)?;
        Ok(())
    }

    fn shutdown(&self) {
        // NotConnected after the first call; idempotent by construction
        let _ = self.shutdown_handle.shutdown(Shutdown::Both);
    }
}

impl std::fmt::Debug for TcpIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpIo")
            .field("peer", &self.shutdown_handle.peer_addr().ok())
            .finish()
    }
}

/// Bind a listener, connect a client, and return both connected endpoints.
/// Test and demo helper for same-process wiring.
pub fn tcp_pair() -> Result<(TcpIo, TcpIo)> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    let client = TcpIo::connect(addr)?;
    let server = TcpIo::accept(&listener)?;
    Ok((client, server))
}
