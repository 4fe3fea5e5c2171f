// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! The remote half of the offload handshake.
//!
//! The remote reconstructs the transferred sub-graph, mirrors every
//! lifecycle transition the host forwards, and services a single-threaded
//! run loop that also watches the reconstructed graph for node-level
//! error/EOS/state-changed notifications and forwards them upstream.
//!
//! Exchanger callbacks never block: they record work under the instance
//! mutex, broadcast the condvar, and the run loop answers later using the
//! stored response id.

use super::{
    send_generic_blocking, ChannelArena, ChannelHub, EXCHANGER_EOS, EXCHANGER_ERROR,
    EXCHANGER_GENERIC, EXCHANGER_HEARTBEAT, EXCHANGER_PING, EXCHANGER_STATECHANGE,
    HeartbeatConfig, HeartbeatMonitor, TRANSFER_GRAPH, TRANSFER_PARAMS, TRANSFER_READY,
};
use crate::codec::{decode_graph, RemoteConnectionCandidate};
use crate::comms::{
    encode_bool_ack, encode_error_message, encode_state_outcome, CommsChannel, Exchanger,
    GenericVerdict, StateChangeDisposition,
};
use crate::constants::{DEFAULT_CHANNEL_ID, DEFAULT_READY_TIMEOUT};
use crate::error::{Error, Result};
use crate::graph::{
    EventDrain, Graph, GraphEvent, NodeFactory, PadDirection, PadLink, StateChangeOutcome,
    StateTransition,
};
use crate::offload::params::InstanceParams;
use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How often the run loop polls the graph bus while no control work is
/// pending. Control work itself wakes the loop immediately.
const RUN_LOOP_TICK: Duration = Duration::from_millis(20);

/// Remote-side configuration.
#[derive(Debug, Clone, Copy)]
pub struct RemoteInstanceConfig {
    /// Heartbeat cadence for the monitor probing the host
    pub heartbeat: HeartbeatConfig,
    /// Bound on the blocking ready announcement
    pub ready_ack_timeout: Duration,
}

impl Default for RemoteInstanceConfig {
    fn default() -> Self {
        Self {
            heartbeat: HeartbeatConfig::default(),
            ready_ack_timeout: DEFAULT_READY_TIMEOUT,
        }
    }
}

/// Callback resolving boundary pads against externally supplied channel ids
/// once the transferred graph has been decoded.
pub type GraphHandler =
    Box<dyn FnMut(&mut Graph, &[RemoteConnectionCandidate]) -> Result<()> + Send>;
/// Callback observing the applied instance params.
pub type ParamsHandler = Box<dyn Fn(&InstanceParams) + Send + Sync>;

#[derive(Default)]
struct RemoteState {
    params: Option<InstanceParams>,
    graph_payload: Option<(Vec<Bytes>, u64)>,
    transitions: VecDeque<(StateTransition, u64)>,
    failed: bool,
    fatal_reason: Option<String>,
}

impl RemoteState {
    fn has_work(&self) -> bool {
        self.failed || self.graph_payload.is_some() || !self.transitions.is_empty()
    }
}

struct RemoteShared {
    state: Mutex<RemoteState>,
    cond: Condvar,
    fatal_guard: AtomicBool,
    params_handler: Mutex<Option<ParamsHandler>>,
}

fn escalate_fatal(shared: &RemoteShared, hub: &ChannelHub, reason: &str) {
    if shared.fatal_guard.swap(true, Ordering::SeqCst) {
        return;
    }
    error!(%reason, "remote instance fatal comms failure");
    hub.error_all();
    let mut state = shared.state.lock();
    state.failed = true;
    state.fatal_reason = Some(reason.to_string());
    shared.cond.notify_all();
}

/// The remote half of one offloaded pipeline instance.
///
/// Construct it, install handlers, then call [`run`](Self::run): the calling
/// thread becomes the instance's event loop until teardown or failure.
pub struct RemoteInstance {
    channels: ChannelArena,
    hub: Arc<ChannelHub>,
    shared: Arc<RemoteShared>,
    factory: Arc<dyn NodeFactory>,
    monitor: HeartbeatMonitor,
    graph_handler: Option<GraphHandler>,
    config: RemoteInstanceConfig,
}

impl RemoteInstance {
    /// Build the remote half over a channel arena. Registers the handshake
    /// exchangers on the default channel and starts the heartbeat monitor.
    pub fn new(
        channels: ChannelArena,
        factory: Arc<dyn NodeFactory>,
        config: RemoteInstanceConfig,
    ) -> Result<Self> {
        let default = channels
            .get(&DEFAULT_CHANNEL_ID)
            .ok_or_else(|| {
                Error::Protocol(format!(
                    "channel arena has no default channel (id {})",
                    DEFAULT_CHANNEL_ID
                ))
            })?
            .clone();

        let shared = Arc::new(RemoteShared {
            state: Mutex::new(RemoteState::default()),
            cond: Condvar::new(),
            fatal_guard: AtomicBool::new(false),
            params_handler: Mutex::new(None),
        });
        let hub = ChannelHub::from_arena(&channels);

        for channel in channels.values() {
            let shared = Arc::clone(&shared);
            let hub = Arc::clone(&hub);
            channel.set_failure_callback(move |reason| {
                escalate_fatal(&shared, &hub, reason);
            });
        }

        // Params are applied inline (cheap); the graph payload is deferred
        // to the run loop, which answers with the stored response id
        {
            let shared = Arc::clone(&shared);
            default.register(
                EXCHANGER_GENERIC,
                Exchanger::Generic(Box::new(move |tag, segments, response_id| match tag {
                    TRANSFER_PARAMS => {
                        let Some(payload) = segments.first() else {
                            warn!("instance params without a payload");
                            return GenericVerdict::Ack(false);
                        };
                        match InstanceParams::from_bytes(payload) {
                            Ok(params) => {
                                info!(?params, "instance params applied");
                                let handler = shared.params_handler.lock();
                                if let Some(handler) = handler.as_ref() {
                                    handler(&params);
                                }
                                shared.state.lock().params = Some(params);
                                shared.cond.notify_all();
                                GenericVerdict::Ack(true)
                            }
                            Err(err) => {
                                warn!(%err, "rejected malformed instance params");
                                GenericVerdict::Ack(false)
                            }
                        }
                    }
                    TRANSFER_GRAPH => {
                        let mut state = shared.state.lock();
                        state.graph_payload = Some((segments, response_id));
                        shared.cond.notify_all();
                        GenericVerdict::Deferred
                    }
                    other => {
                        warn!(tag = other, "unexpected generic transfer on remote side");
                        GenericVerdict::Ack(false)
                    }
                })),
            );
        }

        // Transitions are queued for the run loop in arrival order
        {
            let shared = Arc::clone(&shared);
            default.register(
                EXCHANGER_STATECHANGE,
                Exchanger::StateChange(Box::new(move |transition, response_id| {
                    let mut state = shared.state.lock();
                    state.transitions.push_back((transition, response_id));
                    shared.cond.notify_all();
                    StateChangeDisposition::Deferred
                })),
            );
        }

        default.register(EXCHANGER_HEARTBEAT, Exchanger::Heartbeat);
        default.register(EXCHANGER_PING, Exchanger::Ping);

        // The monitor probes the host; a flatline is a fatal comms failure
        let monitor = {
            let shared = Arc::clone(&shared);
            let hub = Arc::clone(&hub);
            HeartbeatMonitor::start(
                Arc::clone(&default),
                config.heartbeat,
                move |reason: String| {
                    escalate_fatal(&shared, &hub, &format!("heartbeat flatline: {}", reason));
                },
            )
        };

        Ok(Self {
            channels,
            hub,
            shared,
            factory,
            monitor,
            graph_handler: None,
            config,
        })
    }

    /// Install the boundary-pad resolver invoked after graph decode.
    pub fn set_graph_handler(
        &mut self,
        handler: impl FnMut(&mut Graph, &[RemoteConnectionCandidate]) -> Result<()> + Send + 'static,
    ) {
        self.graph_handler = Some(Box::new(handler));
    }

    /// Install the observer for applied instance params.
    pub fn set_params_handler(&self, handler: impl Fn(&InstanceParams) + Send + Sync + 'static) {
        *self.shared.params_handler.lock() = Some(Box::new(handler));
    }

    /// The instance params received so far, if any.
    #[must_use]
    pub fn params(&self) -> Option<InstanceParams> {
        self.shared.state.lock().params.clone()
    }

    /// Whether the instance has failed fatally.
    #[must_use]
    pub fn has_failed(&self) -> bool {
        self.shared.fatal_guard.load(Ordering::SeqCst)
    }

    /// Force the whole instance into its fatal state. Same idempotent path
    /// a channel failure takes; the run loop exits with the reason.
    pub fn fail(&self, reason: &str) {
        escalate_fatal(&self.shared, &self.hub, reason);
    }

    fn default_channel(&self) -> &Arc<CommsChannel> {
        self.channels
            .get(&DEFAULT_CHANNEL_ID)
            .unwrap_or_else(|| unreachable!("default channel validated at construction"))
    }

    /// Announce readiness and service the instance until teardown.
    ///
    /// The calling thread becomes the run loop: it decodes the transferred
    /// graph, applies queued transitions, forwards node-level events
    /// upstream, and exits on the terminal Ready→Null transition (answering
    /// it as the last message) or on fatal failure.
    pub fn run(mut self) -> Result<()> {
        let accepted = send_generic_blocking(
            self.default_channel(),
            TRANSFER_READY,
            Vec::new(),
            self.config.ready_ack_timeout,
        )?;
        if !accepted {
            self.monitor.stop();
            return Err(Error::RemoteFailure(
                "host rejected the ready announcement".to_string(),
            ));
        }
        info!("remote instance ready");

        let mut graph: Option<Graph> = None;
        let mut drain: Option<EventDrain> = None;
        // Graph-level EOS: nodes whose output never feeds another serialized
        // node must all report EOS before it goes upstream
        let mut eos_quorum: HashSet<String> = HashSet::new();
        let mut eos_seen: HashSet<String> = HashSet::new();
        let mut eos_sent = false;
        let mut final_reply: Option<(u64, StateChangeOutcome)> = None;

        'serve: loop {
            let work = {
                let mut state = self.shared.state.lock();
                if !state.has_work() {
                    self.shared.cond.wait_for(&mut state, RUN_LOOP_TICK);
                }
                RemoteState {
                    params: None,
                    graph_payload: state.graph_payload.take(),
                    transitions: std::mem::take(&mut state.transitions),
                    failed: state.failed,
                    fatal_reason: state.fatal_reason.clone(),
                }
            };

            if work.failed {
                self.monitor.stop();
                return Err(Error::FatalComms(work.fatal_reason.unwrap_or_default()));
            }

            if let Some((segments, response_id)) = work.graph_payload {
                match self.reconstruct(&segments) {
                    Ok((mut built, candidates)) => {
                        eos_quorum = terminal_nodes(&built);
                        drain = built.take_drain();
                        graph = Some(built);
                        self.default_channel().send(
                            EXCHANGER_GENERIC,
                            vec![encode_bool_ack(true)],
                            response_id,
                        )?;
                        debug!(boundary = candidates.len(), "graph reconstructed and ready");
                    }
                    Err(err) => {
                        // Terminal for this instance; tell the host first
                        error!(%err, "graph reconstruction failed");
                        let _ = self.default_channel().send(
                            EXCHANGER_GENERIC,
                            vec![encode_bool_ack(false)],
                            response_id,
                        );
                        self.monitor.stop();
                        for channel in self.channels.values() {
                            channel.finish();
                        }
                        return Err(err);
                    }
                }
            }

            for (transition, response_id) in work.transitions {
                let outcome = match graph.as_mut() {
                    Some(graph) => graph.set_state(transition),
                    None => {
                        warn!(?transition, "state change before graph transfer");
                        StateChangeOutcome::Failure
                    }
                };
                if transition == StateTransition::ReadyToNull {
                    final_reply = Some((response_id, outcome));
                    break 'serve;
                }
                if response_id != 0 {
                    self.default_channel().send(
                        EXCHANGER_STATECHANGE,
                        vec![encode_state_outcome(outcome)],
                        response_id,
                    )?;
                }
            }

            if let Some(drain) = &drain {
                while let Some(event) = drain.try_next() {
                    self.forward_event(event, &eos_quorum, &mut eos_seen, &mut eos_sent);
                }
            }
        }

        // Event loop has exited; flush whatever the bus still holds, stop
        // probing, and only then answer the terminal transition - it must be
        // the last message on the channel
        for channel in self.channels.values() {
            channel.mark_finishing();
        }
        if let Some(drain) = &drain {
            while let Some(event) = drain.try_next() {
                debug!(?event, "event discarded during teardown");
            }
        }
        self.monitor.stop();
        debug!("buffered logs flushed; sending terminal state-change result");
        if let Some((response_id, outcome)) = final_reply {
            if response_id != 0 {
                let _ = self.default_channel().send(
                    EXCHANGER_STATECHANGE,
                    vec![encode_state_outcome(outcome)],
                    response_id,
                );
            }
        }
        for channel in self.channels.values() {
            channel.finish();
        }
        info!("remote instance torn down");
        Ok(())
    }

    fn reconstruct(
        &mut self,
        segments: &[Bytes],
    ) -> Result<(Graph, Vec<RemoteConnectionCandidate>)> {
        let (mut graph, candidates) = decode_graph(segments, self.factory.as_ref())?;
        if let Some(handler) = self.graph_handler.as_mut() {
            handler(&mut graph, &candidates)?;
        }
        let outcome = graph.set_state(StateTransition::NullToReady);
        if outcome == StateChangeOutcome::Failure {
            return Err(Error::RemoteFailure(
                "reconstructed graph failed to reach ready".to_string(),
            ));
        }
        Ok((graph, candidates))
    }

    fn forward_event(
        &self,
        event: GraphEvent,
        eos_quorum: &HashSet<String>,
        eos_seen: &mut HashSet<String>,
        eos_sent: &mut bool,
    ) {
        match event {
            GraphEvent::Error { node, message } => {
                warn!(%node, %message, "forwarding node error upstream");
                let payload = encode_error_message(&format!("{}: {}", node, message));
                if let Err(err) = self
                    .default_channel()
                    .send(EXCHANGER_ERROR, vec![payload], 0)
                {
                    warn!(%err, "failed to forward node error");
                }
            }
            GraphEvent::Eos { node } => {
                eos_seen.insert(node);
                let quorum_met = eos_quorum.is_empty() || eos_quorum.is_subset(eos_seen);
                if quorum_met && !*eos_sent {
                    *eos_sent = true;
                    info!("sub-graph reached EOS; notifying host");
                    if let Err(err) = self.default_channel().send(EXCHANGER_EOS, Vec::new(), 0) {
                        warn!(%err, "failed to forward EOS");
                    }
                }
            }
            GraphEvent::StateChanged {
                node,
                transition,
                outcome,
            } => {
                debug!(%node, ?transition, ?outcome, "node state changed");
            }
        }
    }
}

impl std::fmt::Debug for RemoteInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteInstance")
            .field("channels", &self.channels.len())
            .field("failed", &self.has_failed())
            .finish()
    }
}

/// Nodes whose source pads never feed another node of the same graph; the
/// EOS quorum the run loop waits on.
fn terminal_nodes(graph: &Graph) -> HashSet<String> {
    let mut names = HashSet::new();
    for node in graph.nodes() {
        let feeds_internal = node.pads().iter().any(|pad| {
            pad.direction() == PadDirection::Source && matches!(pad.link(), PadLink::Internal(_))
        });
        if !feeds_internal {
            names.insert(node.name().to_string());
        }
    }
    names
}
