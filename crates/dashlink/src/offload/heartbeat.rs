// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Heartbeat-based liveness monitoring.
//!
//! A [`HeartbeatMonitor`] owns one background thread that probes the peer
//! through a channel's heartbeat exchanger. A probe that fails or goes
//! unanswered within the timeout is a flatline: the callback fires exactly
//! once and the thread exits. An explicit stop wakes the inter-probe sleep
//! immediately so the thread is always cleanly joinable.

use crate::comms::CommsChannel;
use crate::constants::{DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_HEARTBEAT_TIMEOUT};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Probe cadence and patience.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatConfig {
    /// Pause between successful probes
    pub interval: Duration,
    /// How long a probe may stay unanswered
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_HEARTBEAT_INTERVAL,
            timeout: DEFAULT_HEARTBEAT_TIMEOUT,
        }
    }
}

/// Monitor lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    /// Probing
    Running,
    /// Terminal: a probe failed or timed out; the callback has fired
    Flatlined,
    /// Terminal: explicitly stopped; no callback
    Stopped,
}

struct MonitorShared {
    stop: Mutex<bool>,
    wake: Condvar,
    state: Mutex<MonitorState>,
}

impl MonitorShared {
    fn stop_requested(&self) -> bool {
        *self.stop.lock()
    }

    /// Sleep until the next tick or an explicit stop, whichever is first.
    fn interruptible_sleep(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        let mut stop = self.stop.lock();
        while !*stop {
            if self.wake.wait_until(&mut stop, deadline).timed_out() {
                break;
            }
        }
    }
}

/// Callback fired exactly once on flatline, with a description of the
/// failed probe.
pub type FlatlineCallback = Box<dyn FnOnce(String) + Send>;

/// Background liveness prober layered on a channel's heartbeat exchanger.
pub struct HeartbeatMonitor {
    shared: Arc<MonitorShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl HeartbeatMonitor {
    /// Start probing `channel`. `on_flatline` fires at most once.
    pub fn start(
        channel: Arc<CommsChannel>,
        config: HeartbeatConfig,
        on_flatline: impl FnOnce(String) + Send + 'static,
    ) -> Self {
        let shared = Arc::new(MonitorShared {
            stop: Mutex::new(false),
            wake: Condvar::new(),
            state: Mutex::new(MonitorState::Running),
        });
        let thread = {
            let shared = Arc::clone(&shared);
            let callback: FlatlineCallback = Box::new(on_flatline);
            thread::Builder::new()
                .name("dashlink-heartbeat".to_string())
                .spawn(move || monitor_loop(&shared, &channel, config, callback))
                .ok()
        };
        if thread.is_none() {
            warn!("failed to spawn heartbeat monitor thread");
            *shared.state.lock() = MonitorState::Stopped;
        }
        Self {
            shared,
            thread: Mutex::new(thread),
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> MonitorState {
        *self.shared.state.lock()
    }

    /// Request a stop and join the thread. No callback fires for an
    /// explicit stop.
    pub fn stop(&self) {
        {
            let mut stop = self.shared.stop.lock();
            *stop = true;
            self.shared.wake.notify_all();
        }
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("heartbeat monitor thread panicked");
            }
        }
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for HeartbeatMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatMonitor")
            .field("state", &self.state())
            .finish()
    }
}

fn monitor_loop(
    shared: &MonitorShared,
    channel: &CommsChannel,
    config: HeartbeatConfig,
    callback: FlatlineCallback,
) {
    debug!(interval = ?config.interval, timeout = ?config.timeout, "heartbeat monitor running");
    loop {
        if shared.stop_requested() {
            *shared.state.lock() = MonitorState::Stopped;
            debug!("heartbeat monitor stopped");
            return;
        }
        match channel.send_and_wait("heartbeat", Vec::new(), config.timeout) {
            Ok(_) => {
                shared.interruptible_sleep(config.interval);
            }
            Err(err) => {
                // A stop that raced the probe is not a flatline
                if shared.stop_requested() {
                    *shared.state.lock() = MonitorState::Stopped;
                    debug!("heartbeat monitor stopped during probe");
                    return;
                }
                *shared.state.lock() = MonitorState::Flatlined;
                warn!(%err, "heartbeat flatline");
                callback(err.to_string());
                return;
            }
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::comms::{Exchanger, LoopbackIo};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn probed_pair() -> (Arc<CommsChannel>, CommsChannel) {
        let (a, b) = LoopbackIo::pair();
        let prober = Arc::new(CommsChannel::new("prober", Arc::new(a)));
        let target = CommsChannel::new("target", Arc::new(b));
        target.register("heartbeat", Exchanger::Heartbeat);
        (prober, target)
    }

    fn fast_config() -> HeartbeatConfig {
        HeartbeatConfig {
            interval: Duration::from_millis(10),
            timeout: Duration::from_millis(200),
        }
    }

    #[test]
    fn test_successful_probes_never_flatline() {
        let (prober, _target) = probed_pair();
        let flatlines = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&flatlines);
        let monitor = HeartbeatMonitor::start(prober, fast_config(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        // Several probe cycles worth of time
        thread::sleep(Duration::from_millis(100));
        assert_eq!(monitor.state(), MonitorState::Running);
        monitor.stop();
        assert_eq!(monitor.state(), MonitorState::Stopped);
        assert_eq!(flatlines.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_dead_peer_flatlines_exactly_once() {
        let (prober, target) = probed_pair();
        let flatlines = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&flatlines);
        let monitor = HeartbeatMonitor::start(prober, fast_config(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        thread::sleep(Duration::from_millis(40));
        target.error_state();
        // Wait for the next probe to fail and the thread to exit
        thread::sleep(Duration::from_millis(300));
        assert_eq!(monitor.state(), MonitorState::Flatlined);
        assert_eq!(flatlines.load(Ordering::SeqCst), 1);
        // stop() after flatline is a no-op join
        monitor.stop();
        assert_eq!(monitor.state(), MonitorState::Flatlined);
    }

    #[test]
    fn test_stop_wakes_sleep_immediately() {
        let (prober, _target) = probed_pair();
        let config = HeartbeatConfig {
            interval: Duration::from_secs(3600),
            timeout: Duration::from_millis(500),
        };
        let monitor = HeartbeatMonitor::start(prober, config, |_| {});
        thread::sleep(Duration::from_millis(50));
        let start = Instant::now();
        monitor.stop();
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(monitor.state(), MonitorState::Stopped);
    }
}
