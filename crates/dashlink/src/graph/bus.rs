//! Node-level event bus.
//!
//! Nodes post error/EOS/state-changed notifications here; the remote half's
//! run loop drains them and forwards what the host needs to see.

use super::{StateChangeOutcome, StateTransition};
use std::sync::mpsc;
use std::time::Duration;

/// One node-level notification.
#[derive(Debug, Clone, PartialEq)]
pub enum GraphEvent {
    /// A node reported an error
    Error {
        /// Instance name of the reporting node
        node: String,
        /// Human-readable description
        message: String,
    },
    /// A node reached end-of-stream
    Eos {
        /// Instance name of the reporting node
        node: String,
    },
    /// A node completed a state transition
    StateChanged {
        /// Instance name of the node
        node: String,
        /// The transition that ran
        transition: StateTransition,
        /// How it went
        outcome: StateChangeOutcome,
    },
}

/// Posting side of the bus. Cheap to clone; owned by the graph and handed to
/// node behaviours during state changes.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: mpsc::Sender<GraphEvent>,
}

impl EventBus {
    /// Create a connected bus/drain pair.
    #[must_use]
    pub fn channel() -> (EventBus, EventDrain) {
        let (tx, rx) = mpsc::channel();
        (EventBus { tx }, EventDrain { rx })
    }

    /// Post one event. Silently dropped when nobody is draining, which is
    /// the correct behavior for a graph running without a remote half.
    pub fn post(&self, event: GraphEvent) {
        let _ = self.tx.send(event);
    }
}

/// Draining side of the bus. Owned by whichever loop services the graph.
#[derive(Debug)]
pub struct EventDrain {
    rx: mpsc::Receiver<GraphEvent>,
}

impl EventDrain {
    /// Take the next event if one is already queued.
    #[must_use]
    pub fn try_next(&self) -> Option<GraphEvent> {
        self.rx.try_recv().ok()
    }

    /// Block up to `timeout` for the next event.
    #[must_use]
    pub fn next_timeout(&self, timeout: Duration) -> Option<GraphEvent> {
        self.rx.recv_timeout(timeout).ok()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_post_and_drain() {
        let (bus, drain) = EventBus::channel();
        bus.post(GraphEvent::Eos {
            node: "sink0".to_string(),
        });
        assert_eq!(
            drain.try_next(),
            Some(GraphEvent::Eos {
                node: "sink0".to_string()
            })
        );
        assert_eq!(drain.try_next(), None);
    }

    #[test]
    fn test_post_without_drain_is_silent() {
        let (bus, drain) = EventBus::channel();
        drop(drain);
        bus.post(GraphEvent::Eos {
            node: "sink0".to_string(),
        });
    }

    #[test]
    fn test_next_timeout_elapses() {
        let (_bus, drain) = EventBus::channel();
        assert_eq!(drain.next_timeout(Duration::from_millis(20)), None);
    }
}
