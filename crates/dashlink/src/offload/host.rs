// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! The host half of the offload handshake.
//!
//! The host keeps the original graph topology, serializes the offloaded
//! sub-graph, and forwards every lifecycle transition to the remote half.
//! It also owns the EOS latch: an upstream EOS surfaces only once both the
//! local half (when it owns ingress boundary pads) and the remote half have
//! reported end-of-stream.

use super::{
    send_generic_blocking, ChannelArena, ChannelHub, EXCHANGER_EOS, EXCHANGER_ERROR,
    EXCHANGER_GENERIC, EXCHANGER_HEARTBEAT, EXCHANGER_PING, EXCHANGER_STATECHANGE, TRANSFER_GRAPH,
    TRANSFER_PARAMS, TRANSFER_READY,
};
use crate::codec::{encode_graph, RemoteConnectionCandidate};
use crate::comms::{
    decode_state_outcome, encode_state_transition, CommsChannel, Exchanger, GenericVerdict,
};
use crate::constants::{
    DEFAULT_ACK_TIMEOUT, DEFAULT_CHANNEL_ID, DEFAULT_READY_TIMEOUT, DEFAULT_STATE_CHANGE_TIMEOUT,
};
use crate::error::{Error, Result};
use crate::graph::{Graph, PadDirection, StateChangeOutcome, StateTransition};
use crate::offload::params::InstanceParams;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Host-side timeouts.
#[derive(Debug, Clone, Copy)]
pub struct OffloadHostConfig {
    /// Bound on the wait for the remote's ready announcement
    pub ready_timeout: std::time::Duration,
    /// Bound on params and graph-transfer round-trips
    pub ack_timeout: std::time::Duration,
    /// Bound on blocking state-change round-trips
    pub state_change_timeout: std::time::Duration,
}

impl Default for OffloadHostConfig {
    fn default() -> Self {
        Self {
            ready_timeout: DEFAULT_READY_TIMEOUT,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            state_change_timeout: DEFAULT_STATE_CHANGE_TIMEOUT,
        }
    }
}

/// Callback fired once when the instance fails fatally.
pub type FatalCallback = Box<dyn FnOnce(String) + Send>;
/// Callback fired once when the EOS latch opens.
pub type EosLatchCallback = Box<dyn Fn() + Send + Sync>;
/// Callback receiving informational error messages forwarded by the remote.
pub type RemoteErrorCallback = Box<dyn Fn(String) + Send + Sync>;

#[derive(Default)]
struct HostCallbacks {
    on_eos: Mutex<Option<EosLatchCallback>>,
    on_remote_error: Mutex<Option<RemoteErrorCallback>>,
    on_fatal: Mutex<Option<FatalCallback>>,
}

#[derive(Debug, Default)]
struct HostState {
    remote_ready: bool,
    remote_eos: bool,
    local_eos: bool,
    eos_fired: bool,
    ingress_boundary_pads: usize,
    failed: bool,
    fatal_reason: Option<String>,
}

struct HostShared {
    state: Mutex<HostState>,
    cond: Condvar,
    fatal_guard: AtomicBool,
    callbacks: HostCallbacks,
}

impl HostShared {
    /// Decide under the lock, fire outside it.
    fn latch_should_fire(state: &mut HostState) -> bool {
        if state.eos_fired {
            return false;
        }
        if state.remote_eos && (state.ingress_boundary_pads == 0 || state.local_eos) {
            state.eos_fired = true;
            return true;
        }
        false
    }

    fn fire_eos(&self) {
        info!("upstream EOS latch opened");
        let callback = self.callbacks.on_eos.lock();
        if let Some(callback) = callback.as_ref() {
            callback();
        }
    }
}

/// Escalate one fatal comms failure instance-wide. Idempotent.
fn escalate_fatal(shared: &HostShared, hub: &ChannelHub, reason: &str) {
    if shared.fatal_guard.swap(true, Ordering::SeqCst) {
        return;
    }
    error!(%reason, "host instance fatal comms failure");
    hub.error_all();
    {
        let mut state = shared.state.lock();
        state.failed = true;
        state.fatal_reason = Some(reason.to_string());
        shared.cond.notify_all();
    }
    let callback = shared.callbacks.on_fatal.lock().take();
    if let Some(callback) = callback {
        callback(format!("fatal comms failure: {}", reason));
    }
}

/// The host half of one offloaded pipeline instance.
pub struct OffloadHost {
    channels: ChannelArena,
    hub: Arc<ChannelHub>,
    shared: Arc<HostShared>,
    config: OffloadHostConfig,
}

impl OffloadHost {
    /// Build the host half over a channel arena. The arena must contain the
    /// default channel (id 0); exchangers are registered on it here.
    pub fn new(channels: ChannelArena, config: OffloadHostConfig) -> Result<Self> {
        let default = channels
            .get(&DEFAULT_CHANNEL_ID)
            .ok_or_else(|| {
                Error::Protocol(format!(
                    "channel arena has no default channel (id {})",
                    DEFAULT_CHANNEL_ID
                ))
            })?
            .clone();

        let shared = Arc::new(HostShared {
            state: Mutex::new(HostState::default()),
            cond: Condvar::new(),
            fatal_guard: AtomicBool::new(false),
            callbacks: HostCallbacks::default(),
        });
        let hub = ChannelHub::from_arena(&channels);

        // Any channel failing escalates once for the whole instance
        for channel in channels.values() {
            let shared = Arc::clone(&shared);
            let hub = Arc::clone(&hub);
            channel.set_failure_callback(move |reason| {
                escalate_fatal(&shared, &hub, reason);
            });
        }

        // Ready announcements from the remote
        {
            let shared = Arc::clone(&shared);
            default.register(
                EXCHANGER_GENERIC,
                Exchanger::Generic(Box::new(move |tag, _segments, _response_id| match tag {
                    TRANSFER_READY => {
                        debug!("remote announced ready");
                        let mut state = shared.state.lock();
                        state.remote_ready = true;
                        shared.cond.notify_all();
                        GenericVerdict::Ack(true)
                    }
                    other => {
                        warn!(tag = other, "unexpected generic transfer on host side");
                        GenericVerdict::Ack(false)
                    }
                })),
            );
        }

        // Remote EOS notifications feed the latch
        {
            let shared = Arc::clone(&shared);
            default.register(
                EXCHANGER_EOS,
                Exchanger::Eos(Box::new(move || {
                    let fire = {
                        let mut state = shared.state.lock();
                        state.remote_eos = true;
                        shared.cond.notify_all();
                        HostShared::latch_should_fire(&mut state)
                    };
                    if fire {
                        shared.fire_eos();
                    }
                })),
            );
        }

        // Informational error messages from the remote; never escalated
        {
            let shared = Arc::clone(&shared);
            default.register(
                EXCHANGER_ERROR,
                Exchanger::ErrorMessage(Box::new(move |message| {
                    warn!(%message, "remote reported an error");
                    let callback = shared.callbacks.on_remote_error.lock();
                    if let Some(callback) = callback.as_ref() {
                        callback(message);
                    }
                })),
            );
        }

        // The remote's heartbeat monitor probes us; answer it
        default.register(EXCHANGER_HEARTBEAT, Exchanger::Heartbeat);
        default.register(EXCHANGER_PING, Exchanger::Ping);

        Ok(Self {
            channels,
            hub,
            shared,
            config,
        })
    }

    /// Install the callback fired once when the EOS latch opens.
    pub fn set_eos_callback(&self, callback: impl Fn() + Send + Sync + 'static) {
        *self.shared.callbacks.on_eos.lock() = Some(Box::new(callback));
    }

    /// Install the callback receiving informational remote errors.
    pub fn set_remote_error_callback(&self, callback: impl Fn(String) + Send + Sync + 'static) {
        *self.shared.callbacks.on_remote_error.lock() = Some(Box::new(callback));
    }

    /// Install the callback fired exactly once on fatal comms failure.
    pub fn set_fatal_callback(&self, callback: impl FnOnce(String) + Send + 'static) {
        *self.shared.callbacks.on_fatal.lock() = Some(Box::new(callback));
    }

    /// One channel by id.
    #[must_use]
    pub fn channel(&self, id: u32) -> Option<&Arc<CommsChannel>> {
        self.channels.get(&id)
    }

    /// The default (handshake) channel.
    fn default_channel(&self) -> &Arc<CommsChannel> {
        // new() guarantees presence
        self.channels
            .get(&DEFAULT_CHANNEL_ID)
            .unwrap_or_else(|| unreachable!("default channel validated at construction"))
    }

    /// Whether the instance has failed fatally.
    #[must_use]
    pub fn has_failed(&self) -> bool {
        self.shared.fatal_guard.load(Ordering::SeqCst)
    }

    /// Force the whole instance into its fatal state. Same idempotent path
    /// a channel failure takes.
    pub fn fail(&self, reason: &str) {
        escalate_fatal(&self.shared, &self.hub, reason);
    }

    /// Block until the remote announces readiness (bounded).
    pub fn wait_remote_ready(&self) -> Result<()> {
        let deadline = Instant::now() + self.config.ready_timeout;
        let mut state = self.shared.state.lock();
        while !state.remote_ready && !state.failed {
            if self.shared.cond.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        if state.failed {
            return Err(Error::FatalComms(
                state.fatal_reason.clone().unwrap_or_default(),
            ));
        }
        if !state.remote_ready {
            return Err(Error::HandshakeTimeout {
                step: "ready".to_string(),
                timeout: self.config.ready_timeout,
            });
        }
        debug!("remote is ready");
        Ok(())
    }

    /// Send instance parameters; the remote applies them exactly once.
    pub fn send_params(&self, params: &InstanceParams) -> Result<()> {
        let payload = params.to_bytes()?;
        let accepted = send_generic_blocking(
            self.default_channel(),
            TRANSFER_PARAMS,
            vec![payload],
            self.config.ack_timeout,
        )?;
        if !accepted {
            return Err(Error::RemoteFailure(
                "remote rejected instance params".to_string(),
            ));
        }
        debug!(?params, "instance params applied remotely");
        Ok(())
    }

    /// Serialize `graph` and transfer it. On success the remote has brought
    /// its reconstruction to Ready; the returned candidates are the boundary
    /// pads this side must wire to egress/ingress adapters.
    ///
    /// The ingress side of the EOS latch is derived from the candidates: a
    /// sink-direction boundary pad means data enters the sub-graph from the
    /// host, so a local EOS must also be observed before EOS goes upstream.
    pub fn transfer_graph(&self, graph: &Graph) -> Result<Vec<RemoteConnectionCandidate>> {
        let (segments, candidates) = encode_graph(graph)?;
        let ingress = candidates
            .iter()
            .filter(|c| {
                graph
                    .pad(c.pad)
                    .map(|p| p.direction() == PadDirection::Sink)
                    .unwrap_or(false)
            })
            .count();
        {
            let mut state = self.shared.state.lock();
            state.ingress_boundary_pads = ingress;
        }

        let accepted = send_generic_blocking(
            self.default_channel(),
            TRANSFER_GRAPH,
            segments,
            self.config.ack_timeout,
        )?;
        if !accepted {
            // Terminal for the remote instance
            return Err(Error::RemoteFailure(
                "remote failed to reconstruct the transferred graph".to_string(),
            ));
        }
        info!(
            nodes = graph.node_count(),
            boundary = candidates.len(),
            ingress,
            "graph transferred"
        );
        Ok(candidates)
    }

    /// Override the ingress-boundary count the EOS latch waits on.
    pub fn set_ingress_boundary_pads(&self, count: usize) {
        let mut state = self.shared.state.lock();
        state.ingress_boundary_pads = count;
    }

    /// Forward a lifecycle transition and block for the remote's result.
    pub fn set_remote_state(&self, transition: StateTransition) -> Result<StateChangeOutcome> {
        let reply = self.default_channel().send_and_wait(
            EXCHANGER_STATECHANGE,
            vec![encode_state_transition(transition)],
            self.config.state_change_timeout,
        )?;
        let outcome = decode_state_outcome(&reply)?;
        debug!(?transition, ?outcome, "remote state change");
        Ok(outcome)
    }

    /// Forward a lifecycle transition without waiting for the result.
    pub fn post_remote_state(&self, transition: StateTransition) -> Result<()> {
        self.default_channel().send(
            EXCHANGER_STATECHANGE,
            vec![encode_state_transition(transition)],
            0,
        )
    }

    /// Record that the local half observed EOS on its ingress side.
    pub fn notify_local_eos(&self) {
        let fire = {
            let mut state = self.shared.state.lock();
            state.local_eos = true;
            self.shared.cond.notify_all();
            HostShared::latch_should_fire(&mut state)
        };
        if fire {
            self.shared.fire_eos();
        }
    }

    /// Tear the instance down: the final Ready→Null state change is the last
    /// message exchanged, then every channel is finished.
    pub fn teardown(&self) -> Result<StateChangeOutcome> {
        // The remote closes its transport right after answering; mark the
        // teardown in progress so that close is not escalated as a failure
        for channel in self.channels.values() {
            channel.mark_finishing();
        }
        let result = self.set_remote_state(StateTransition::ReadyToNull);
        for channel in self.channels.values() {
            channel.finish();
        }
        match &result {
            Ok(outcome) => info!(?outcome, "offload instance torn down"),
            Err(err) => warn!(%err, "teardown state change did not complete cleanly"),
        }
        result
    }
}

impl std::fmt::Debug for OffloadHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OffloadHost")
            .field("channels", &self.channels.len())
            .field("failed", &self.has_failed())
            .finish()
    }
}
