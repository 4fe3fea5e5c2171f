//! In-process loopback transport.
//!
//! [`LoopbackIo::pair`] returns two connected endpoints backed by a pair of
//! byte pipes. Shutting down either endpoint closes both directions so a
//! blocked peer read returns `ConnectionClosed` immediately. This is the
//! primary transport for tests and for co-located host/remote halves.

use super::io::{CommsIo, IoError, IoResult};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Debug, Default)]
struct PipeBuf {
    data: VecDeque<u8>,
    closed: bool,
}

#[derive(Debug, Default)]
struct Pipe {
    buf: Mutex<PipeBuf>,
    readable: Condvar,
}

impl Pipe {
    fn write(&self, bytes: &[u8]) -> IoResult<()> {
        let mut buf = self.buf.lock();
        if buf.closed {
            return Err(IoError::ConnectionClosed);
        }
        buf.data.extend(bytes);
        self.readable.notify_all();
        Ok(())
    }

    fn read_exact(&self, out: &mut [u8]) -> IoResult<()> {
        let mut buf = self.buf.lock();
        while buf.data.len() < out.len() {
            if buf.closed {
                return Err(IoError::ConnectionClosed);
            }
            self.readable.wait(&mut buf);
        }
        for slot in out.iter_mut() {
            // len was checked above; pop_front cannot run dry here
            *slot = buf.data.pop_front().unwrap_or_default();
        }
        Ok(())
    }

    fn close(&self) {
        let mut buf = self.buf.lock();
        buf.closed = true;
        self.readable.notify_all();
    }
}

/// One endpoint of an in-process transport pair.
#[derive(Debug, Clone)]
pub struct LoopbackIo {
    incoming: Arc<Pipe>,
    outgoing: Arc<Pipe>,
}

impl LoopbackIo {
    /// Create two connected endpoints.
    #[must_use]
    pub fn pair() -> (LoopbackIo, LoopbackIo) {
        let a_to_b = Arc::new(Pipe::default());
        let b_to_a = Arc::new(Pipe::default());
        let a = LoopbackIo {
            incoming: Arc::clone(&b_to_a),
            outgoing: Arc::clone(&a_to_b),
        };
        let b = LoopbackIo {
            incoming: a_to_b,
            outgoing: b_to_a,
        };
        (a, b)
    }
}

impl CommsIo for LoopbackIo {
    fn read_exact(&self, buf: &mut [u8]) -> IoResult<()> {
        self.incoming.read_exact(buf)
    }

    fn write_all(&self, buf: &[u8]) -> IoResult<()> {
        self.outgoing.write(buf)
    }

    fn shutdown(&self) {
        self.incoming.close();
        self.outgoing.close();
    }
}
