// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! The multiplexed logical connection wrapping one transport.
//!
//! A [`CommsChannel`] owns one [`CommsIo`] endpoint and one dedicated
//! receiver thread. Exchangers are registered by name; outgoing round-trips
//! are correlated through monotonically allocated response ids. The failure
//! path is idempotent: however many things go wrong on one channel, the
//! failure callback fires exactly once and every blocked round-trip is woken
//! with a closed result so nothing hangs.

use super::exchanger::{Exchanger, ReplyPort};
use super::frame::{read_frame, write_frame, ReadOutcome};
use super::io::{CommsIo, IoCapabilities, IoError};
use super::response::{Response, ResponseState};
use crate::error::{Error, Result};
use crate::wire::concat_segments;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Callback fired exactly once when the channel fails. Receives a
/// description of the first failure observed.
pub type FailureCallback = Box<dyn Fn(&str) + Send + Sync>;

struct ChannelInner {
    name: String,
    io: Arc<dyn CommsIo>,
    exchangers: DashMap<String, Exchanger>,
    pending: DashMap<u64, Arc<Response>>,
    next_response_id: AtomicU64,
    failed: AtomicBool,
    finishing: AtomicBool,
    write_lock: Mutex<()>,
    failure_cb: Mutex<Option<FailureCallback>>,
}

impl ChannelInner {
    fn dispatch(&self, exchanger_name: String, segments: Vec<Bytes>, response_id: u64) {
        if response_id != 0 {
            if let Some((_, response)) = self.pending.remove(&response_id) {
                response.fulfill(concat_segments(segments));
                return;
            }
        }
        match self.exchangers.get(&exchanger_name) {
            Some(entry) => entry
                .value()
                .received(&exchanger_name, segments, response_id, self),
            None => warn!(
                channel = %self.name,
                exchanger = %exchanger_name,
                "dropped message for unknown exchanger"
            ),
        }
    }

    fn send_frame(&self, exchanger: &str, segments: &[Bytes], response_id: u64) -> Result<()> {
        if self.failed.load(Ordering::SeqCst) {
            return Err(Error::ConnectionClosed);
        }
        let result = {
            let _guard = self.write_lock.lock();
            write_frame(self.io.as_ref(), exchanger, response_id, segments)
        };
        match result {
            Ok(()) => Ok(()),
            Err(err) => {
                let reason = err.to_string();
                self.escalate_failure(&reason);
                Err(err.into())
            }
        }
    }

    /// Idempotent failure path: first caller wins, everyone else returns.
    fn escalate_failure(&self, reason: &str) {
        if self.failed.swap(true, Ordering::SeqCst) {
            return;
        }
        let finishing = self.finishing.load(Ordering::SeqCst);
        if finishing {
            debug!(channel = %self.name, %reason, "channel closed during finish");
        } else {
            error!(channel = %self.name, %reason, "channel failure");
        }
        // Wake every thread blocked in send_and_wait before anything else
        self.pending.retain(|_, response| {
            response.close();
            false
        });
        self.io.shutdown();
        if !finishing {
            let callback = self.failure_cb.lock();
            if let Some(callback) = callback.as_ref() {
                callback(reason);
            }
        }
    }
}

impl ReplyPort for ChannelInner {
    fn reply(&self, exchanger: &str, segments: Vec<Bytes>, response_id: u64) {
        if let Err(err) = self.send_frame(exchanger, &segments, response_id) {
            warn!(
                channel = %self.name,
                exchanger,
                response_id,
                %err,
                "failed to send exchanger reply"
            );
        }
    }
}

/// A multiplexed logical connection.
///
/// Created with one transport endpoint; `finish` closes gracefully,
/// `error_state` force-fails. Either way the channel is spent afterwards.
pub struct CommsChannel {
    inner: Arc<ChannelInner>,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl CommsChannel {
    /// Wrap a transport endpoint and start the receiver thread.
    pub fn new(name: impl Into<String>, io: Arc<dyn CommsIo>) -> Self {
        let name = name.into();
        let inner = Arc::new(ChannelInner {
            name: name.clone(),
            io,
            exchangers: DashMap::new(),
            pending: DashMap::new(),
            next_response_id: AtomicU64::new(1),
            failed: AtomicBool::new(false),
            finishing: AtomicBool::new(false),
            write_lock: Mutex::new(()),
            failure_cb: Mutex::new(None),
        });
        let receiver = {
            let inner = Arc::clone(&inner);
            thread::Builder::new()
                .name(format!("dashlink-recv-{}", name))
                .spawn(move || receive_loop(&inner))
                .ok()
        };
        if receiver.is_none() {
            // Out of threads; the channel is unusable from the start
            inner.escalate_failure("failed to spawn receiver thread");
        }
        Self {
            inner,
            receiver: Mutex::new(receiver),
        }
    }

    /// The channel's name (used in logs only; not on the wire).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Register an exchanger under `name`. Replacing a live registration is
    /// almost certainly a bug and is logged.
    pub fn register(&self, name: impl Into<String>, exchanger: Exchanger) {
        let name = name.into();
        if let Some(previous) = self.inner.exchangers.insert(name.clone(), exchanger) {
            warn!(
                channel = %self.inner.name,
                exchanger = %name,
                previous = previous.kind(),
                "replaced a registered exchanger"
            );
        }
    }

    /// Remove an exchanger registration.
    pub fn unregister(&self, name: &str) -> Option<Exchanger> {
        self.inner.exchangers.remove(name).map(|(_, e)| e)
    }

    /// Install the failure callback. If the channel already failed, the
    /// callback fires immediately so the failure cannot be missed.
    pub fn set_failure_callback(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        let already_failed = {
            let mut slot = self.inner.failure_cb.lock();
            *slot = Some(Box::new(callback));
            self.inner.failed.load(Ordering::SeqCst) && !self.inner.finishing.load(Ordering::SeqCst)
        };
        if already_failed {
            let slot = self.inner.failure_cb.lock();
            if let Some(callback) = slot.as_ref() {
                callback("channel failed before callback registration");
            }
        }
    }

    /// Send one message without waiting. A `response_id` of zero means no
    /// response is expected; a nonzero id answers an earlier request.
    pub fn send(&self, exchanger: &str, segments: Vec<Bytes>, response_id: u64) -> Result<()> {
        self.inner.send_frame(exchanger, &segments, response_id)
    }

    /// Send one message and block until the reply arrives or `timeout`
    /// elapses (zero waits indefinitely). Returns the reply payload.
    pub fn send_and_wait(
        &self,
        exchanger: &str,
        segments: Vec<Bytes>,
        timeout: Duration,
    ) -> Result<Bytes> {
        let inner = &self.inner;
        if inner.failed.load(Ordering::SeqCst) {
            return Err(Error::ConnectionClosed);
        }
        let id = inner.next_response_id.fetch_add(1, Ordering::SeqCst);
        let response = Arc::new(Response::new(id));
        inner.pending.insert(id, Arc::clone(&response));
        // A failure escalation that raced the insert above has already swept
        // the pending table; re-check so this wait cannot be stranded
        if inner.failed.load(Ordering::SeqCst) {
            inner.pending.remove(&id);
            response.close();
        }
        if let Err(err) = inner.send_frame(exchanger, &segments, id) {
            inner.pending.remove(&id);
            return Err(err);
        }
        let state = response.wait(timeout);
        inner.pending.remove(&id);
        match state {
            ResponseState::Received => Ok(response.payload()),
            ResponseState::TimedOut => Err(Error::HandshakeTimeout {
                step: exchanger.to_string(),
                timeout,
            }),
            ResponseState::Closed | ResponseState::Pending => Err(Error::ConnectionClosed),
        }
    }

    /// Round-trip a ping and return its latency. Connectivity smoke test.
    pub fn ping(&self, timeout: Duration) -> Result<Duration> {
        let start = Instant::now();
        self.send_and_wait("ping", Vec::new(), timeout)?;
        Ok(start.elapsed())
    }

    /// Whether the failure path has run.
    #[must_use]
    pub fn has_failed(&self) -> bool {
        self.inner.failed.load(Ordering::SeqCst)
    }

    /// The transport's preferred buffer kinds.
    #[must_use]
    pub fn io_capabilities(&self) -> IoCapabilities {
        self.inner.io.capabilities()
    }

    /// Force the channel into its failed state. Fires the failure callback
    /// (once) and wakes every blocked round-trip.
    pub fn error_state(&self) {
        self.inner.escalate_failure("error state forced");
    }

    /// Flag the channel as shutting down without closing it yet. A peer
    /// closing the transport after this point is treated as graceful, which
    /// is how the final teardown exchange avoids a spurious failure
    /// escalation on whichever side observes the close first.
    pub(crate) fn mark_finishing(&self) {
        self.inner.finishing.store(true, Ordering::SeqCst);
    }

    /// Graceful shutdown: close the transport and join the receiver thread.
    /// Does not fire the failure callback.
    pub fn finish(&self) {
        self.inner.finishing.store(true, Ordering::SeqCst);
        self.inner.io.shutdown();
        self.inner.pending.retain(|_, response| {
            response.close();
            false
        });
        let handle = self.receiver.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                // finish() from inside an exchanger callback; the loop exits
                // on its own once the transport reports closed
                return;
            }
            if handle.join().is_err() {
                error!(channel = %self.inner.name, "receiver thread panicked");
            }
        }
    }
}

impl Drop for CommsChannel {
    fn drop(&mut self) {
        self.finish();
    }
}

impl std::fmt::Debug for CommsChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommsChannel")
            .field("name", &self.inner.name)
            .field("failed", &self.inner.failed.load(Ordering::SeqCst))
            .finish()
    }
}

fn receive_loop(inner: &Arc<ChannelInner>) {
    debug!(channel = %inner.name, "receiver thread running");
    loop {
        match read_frame(inner.io.as_ref()) {
            Ok(ReadOutcome::Frame(frame)) => {
                inner.dispatch(frame.exchanger, frame.segments, frame.response_id);
            }
            Ok(ReadOutcome::Malformed(reason)) => {
                warn!(channel = %inner.name, %reason, "dropped malformed frame");
            }
            Err(IoError::ConnectionClosed) if inner.finishing.load(Ordering::SeqCst) => {
                debug!(channel = %inner.name, "receiver thread exiting after finish");
                break;
            }
            Err(err) => {
                inner.escalate_failure(&err.to_string());
                break;
            }
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::comms::exchanger::GenericVerdict;
    use crate::comms::{generic_segments, LoopbackIo};
    use std::sync::atomic::AtomicUsize;

    fn channel_pair() -> (CommsChannel, CommsChannel) {
        let (a, b) = LoopbackIo::pair();
        (
            CommsChannel::new("left", Arc::new(a)),
            CommsChannel::new("right", Arc::new(b)),
        )
    }

    #[test]
    fn test_ping_roundtrip() {
        let (left, right) = channel_pair();
        right.register("ping", Exchanger::Ping);
        let latency = left.ping(Duration::from_secs(2)).unwrap();
        assert!(latency < Duration::from_secs(2));
    }

    #[test]
    fn test_unknown_exchanger_keeps_channel_alive() {
        let (left, right) = channel_pair();
        right.register("ping", Exchanger::Ping);
        left.send("nonexistent", Vec::new(), 0).unwrap();
        // The channel survived the unknown name and still answers pings
        left.ping(Duration::from_secs(2)).unwrap();
        assert!(!left.has_failed());
        assert!(!right.has_failed());
    }

    #[test]
    fn test_send_and_wait_timeout() {
        let (left, _right) = channel_pair();
        // Nothing registered on the peer: no reply will ever come
        let err = left
            .send_and_wait("generic", generic_segments(1, Vec::new()), Duration::from_millis(50))
            .unwrap_err();
        assert!(matches!(err, Error::HandshakeTimeout { .. }));
    }

    #[test]
    fn test_failure_callback_fires_exactly_once() {
        let (left, right) = channel_pair();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        left.set_failure_callback(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        left.error_state();
        left.error_state();
        drop(right);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_error_state_wakes_blocked_waiter() {
        let (left, right) = channel_pair();
        let left = Arc::new(left);
        let waiter = {
            let left = Arc::clone(&left);
            thread::spawn(move || left.send_and_wait("generic", generic_segments(1, Vec::new()), Duration::ZERO))
        };
        thread::sleep(Duration::from_millis(30));
        left.error_state();
        assert!(matches!(
            waiter.join().unwrap(),
            Err(Error::ConnectionClosed)
        ));
        drop(right);
    }

    #[test]
    fn test_finish_does_not_fire_failure_callback() {
        let (left, right) = channel_pair();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        left.set_failure_callback(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        left.finish();
        thread::sleep(Duration::from_millis(30));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        drop(right);
    }

    #[test]
    fn test_peer_shutdown_escalates_failure() {
        let (left, right) = channel_pair();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        left.set_failure_callback(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        right.error_state();
        // Give the left receiver thread time to observe the closed transport
        thread::sleep(Duration::from_millis(50));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(left.has_failed());
    }

    #[test]
    fn test_deferred_reply_by_id() {
        let (left, right) = channel_pair();
        let right = Arc::new(right);
        let replier = Arc::clone(&right);
        right.register(
            "generic",
            Exchanger::Generic(Box::new(move |_tag, _segments, response_id| {
                // Answer from another thread after a delay, like a run loop
                let replier = Arc::clone(&replier);
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(30));
                    replier
                        .send("generic", vec![Bytes::from_static(&[1])], response_id)
                        .unwrap();
                });
                GenericVerdict::Deferred
            })),
        );
        let reply = left
            .send_and_wait("generic", generic_segments(3, Vec::new()), Duration::from_secs(2))
            .unwrap();
        assert_eq!(&reply[..], &[1]);
    }
}
