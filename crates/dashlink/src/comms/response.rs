// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Request/response correlation.
//!
//! A [`Response`] is created by a sender before a blocking send and fulfilled
//! by the channel's receiver thread when a reply with a matching id arrives.
//! Ids are allocated monotonically per channel and never reused while a
//! `Response` with that id is outstanding, so a stale or duplicate reply can
//! never corrupt an unrelated pending wait.

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Terminal state of one pending round-trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseState {
    /// No reply yet
    Pending,
    /// A reply arrived and the payload is available
    Received,
    /// The bounded wait elapsed; a later reply will be discarded
    TimedOut,
    /// The channel failed or closed while the wait was in flight
    Closed,
}

#[derive(Debug)]
struct Slot {
    state: ResponseState,
    payload: Bytes,
}

/// One pending round-trip on a channel.
#[derive(Debug)]
pub struct Response {
    id: u64,
    slot: Mutex<Slot>,
    arrived: Condvar,
}

impl Response {
    /// Create a pending response for `id`.
    #[must_use]
    pub fn new(id: u64) -> Self {
        Self {
            id,
            slot: Mutex::new(Slot {
                state: ResponseState::Pending,
                payload: Bytes::new(),
            }),
            arrived: Condvar::new(),
        }
    }

    /// The correlation id this response is waiting on.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Block until the response resolves.
    ///
    /// A zero `timeout` waits indefinitely. The wait re-checks its predicate
    /// in a loop, so spurious wake-ups cannot return a pending state. On
    /// timeout the slot is latched to [`ResponseState::TimedOut`] under the
    /// lock, which is what stops a late [`fulfill`](Self::fulfill) from
    /// mutating a wait that already gave up.
    pub fn wait(&self, timeout: Duration) -> ResponseState {
        let mut slot = self.slot.lock();
        if timeout.is_zero() {
            while slot.state == ResponseState::Pending {
                self.arrived.wait(&mut slot);
            }
        } else {
            let deadline = Instant::now() + timeout;
            while slot.state == ResponseState::Pending {
                if self.arrived.wait_until(&mut slot, deadline).timed_out() {
                    break;
                }
            }
            if slot.state == ResponseState::Pending {
                slot.state = ResponseState::TimedOut;
            }
        }
        slot.state
    }

    /// Deliver the reply payload. Returns false if the wait already resolved
    /// (timed out, closed, or already fulfilled); the payload is dropped.
    pub fn fulfill(&self, payload: Bytes) -> bool {
        let mut slot = self.slot.lock();
        if slot.state != ResponseState::Pending {
            return false;
        }
        slot.state = ResponseState::Received;
        slot.payload = payload;
        self.arrived.notify_all();
        true
    }

    /// Resolve the wait as closed (channel failure or teardown).
    pub fn close(&self) {
        let mut slot = self.slot.lock();
        if slot.state == ResponseState::Pending {
            slot.state = ResponseState::Closed;
            self.arrived.notify_all();
        }
    }

    /// The received payload (empty until fulfilled).
    #[must_use]
    pub fn payload(&self) -> Bytes {
        self.slot.lock().payload.clone()
    }

    /// Copy `dst.len()` payload bytes starting at `offset` into `dst`.
    /// Returns false if the requested range is out of bounds.
    pub fn copy_payload(&self, dst: &mut [u8], offset: usize) -> bool {
        let slot = self.slot.lock();
        let Some(end) = offset.checked_add(dst.len()) else {
            return false;
        };
        if end > slot.payload.len() {
            return false;
        }
        dst.copy_from_slice(&slot.payload[offset..end]);
        true
    }
}
