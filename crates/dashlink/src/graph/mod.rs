// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! The pipeline-graph contract the protocol operates on.
//!
//! A [`Graph`] is a directed graph of typed nodes connected by typed pads.
//! The protocol layer drives a four-state lifecycle over it and serializes
//! its topology; what the nodes *do* is supplied externally through
//! [`NodeBehaviour`] and [`NodeFactory`].

pub mod bus;
pub mod factory;

pub use bus::{EventBus, EventDrain, GraphEvent};
pub use factory::{AnyKindFactory, BehaviourCtor, InertBehaviour, KindRegistry, NodeBehaviour, NodeFactory};

use crate::error::{Error, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

// ============================================================================
// Lifecycle states and transitions
// ============================================================================

/// The four lifecycle states of a node (and of a graph as a whole).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    /// Deallocated / initial
    Null,
    /// Resources allocated, not processing
    Ready,
    /// Processing prepared but paused
    Paused,
    /// Processing
    Playing,
}

/// One step between adjacent lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateTransition {
    /// Null → Ready
    NullToReady,
    /// Ready → Paused
    ReadyToPaused,
    /// Paused → Playing
    PausedToPlaying,
    /// Playing → Paused
    PlayingToPaused,
    /// Paused → Ready
    PausedToReady,
    /// Ready → Null; the terminal teardown direction
    ReadyToNull,
}

impl StateTransition {
    /// Wire code for this transition.
    #[must_use]
    pub fn code(self) -> u32 {
        match self {
            StateTransition::NullToReady => 1,
            StateTransition::ReadyToPaused => 2,
            StateTransition::PausedToPlaying => 3,
            StateTransition::PlayingToPaused => 4,
            StateTransition::PausedToReady => 5,
            StateTransition::ReadyToNull => 6,
        }
    }

    /// Decode a wire code.
    #[must_use]
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(StateTransition::NullToReady),
            2 => Some(StateTransition::ReadyToPaused),
            3 => Some(StateTransition::PausedToPlaying),
            4 => Some(StateTransition::PlayingToPaused),
            5 => Some(StateTransition::PausedToReady),
            6 => Some(StateTransition::ReadyToNull),
            _ => None,
        }
    }

    /// The state this transition starts from.
    #[must_use]
    pub fn origin(self) -> NodeState {
        match self {
            StateTransition::NullToReady => NodeState::Null,
            StateTransition::ReadyToPaused | StateTransition::ReadyToNull => NodeState::Ready,
            StateTransition::PausedToPlaying | StateTransition::PausedToReady => NodeState::Paused,
            StateTransition::PlayingToPaused => NodeState::Playing,
        }
    }

    /// The state this transition lands in.
    #[must_use]
    pub fn target(self) -> NodeState {
        match self {
            StateTransition::NullToReady => NodeState::Ready,
            StateTransition::ReadyToPaused | StateTransition::PlayingToPaused => NodeState::Paused,
            StateTransition::PausedToPlaying => NodeState::Playing,
            StateTransition::PausedToReady => NodeState::Ready,
            StateTransition::ReadyToNull => NodeState::Null,
        }
    }

    /// Whether this transition moves toward Playing.
    #[must_use]
    pub fn is_upward(self) -> bool {
        matches!(
            self,
            StateTransition::NullToReady
                | StateTransition::ReadyToPaused
                | StateTransition::PausedToPlaying
        )
    }
}

/// Result of running one transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateChangeOutcome {
    /// The transition completed
    Success,
    /// The transition will complete asynchronously
    Async,
    /// Completed, but the node cannot produce data in Paused
    NoPreroll,
    /// The transition failed
    Failure,
}

impl StateChangeOutcome {
    /// Wire code for this outcome.
    #[must_use]
    pub fn code(self) -> u32 {
        match self {
            StateChangeOutcome::Success => 1,
            StateChangeOutcome::Async => 2,
            StateChangeOutcome::NoPreroll => 3,
            StateChangeOutcome::Failure => 0,
        }
    }

    /// Decode a wire code.
    #[must_use]
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(StateChangeOutcome::Failure),
            1 => Some(StateChangeOutcome::Success),
            2 => Some(StateChangeOutcome::Async),
            3 => Some(StateChangeOutcome::NoPreroll),
            _ => None,
        }
    }

    /// Aggregation order: Failure dominates, then Async, then NoPreroll.
    fn severity(self) -> u8 {
        match self {
            StateChangeOutcome::Success => 0,
            StateChangeOutcome::NoPreroll => 1,
            StateChangeOutcome::Async => 2,
            StateChangeOutcome::Failure => 3,
        }
    }

    /// Combine two outcomes, keeping the more severe.
    #[must_use]
    pub fn combine(self, other: Self) -> Self {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }
}

// ============================================================================
// Pads
// ============================================================================

/// Which way data flows through a pad.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PadDirection {
    /// Produces data
    Source,
    /// Consumes data
    Sink,
}

impl PadDirection {
    pub(crate) fn code(self) -> u32 {
        match self {
            PadDirection::Source => 1,
            PadDirection::Sink => 2,
        }
    }

    pub(crate) fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(PadDirection::Source),
            2 => Some(PadDirection::Sink),
            _ => None,
        }
    }
}

/// When a pad exists on its node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PadPresence {
    /// Always present
    Always,
    /// Appears depending on the stream
    Sometimes,
    /// Created on request
    Request,
}

impl PadPresence {
    pub(crate) fn code(self) -> u32 {
        match self {
            PadPresence::Always => 1,
            PadPresence::Sometimes => 2,
            PadPresence::Request => 3,
        }
    }

    pub(crate) fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(PadPresence::Always),
            2 => Some(PadPresence::Sometimes),
            3 => Some(PadPresence::Request),
            _ => None,
        }
    }
}

/// Identity of one pad inside one graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PadHandle {
    /// Index of the owning node
    pub node: usize,
    /// Index of the pad within the node
    pub pad: usize,
}

/// Where a pad's peer lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PadLink {
    /// Not linked; not serialized
    Unlinked,
    /// Linked to another pad of this graph
    Internal(PadHandle),
    /// Linked to something outside this graph; becomes a boundary pad
    External,
}

/// One pad on one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pad {
    name: String,
    direction: PadDirection,
    presence: PadPresence,
    link: PadLink,
}

impl Pad {
    /// The pad's name, unique within its node.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Data-flow direction.
    #[must_use]
    pub fn direction(&self) -> PadDirection {
        self.direction
    }

    /// Presence class.
    #[must_use]
    pub fn presence(&self) -> PadPresence {
        self.presence
    }

    /// Current link state.
    #[must_use]
    pub fn link(&self) -> PadLink {
        self.link
    }
}

// ============================================================================
// Typed property values
// ============================================================================

/// A typed node property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    /// Boolean
    Bool(bool),
    /// Signed 32-bit
    I32(i32),
    /// Signed 64-bit
    I64(i64),
    /// Unsigned 32-bit
    U32(u32),
    /// Unsigned 64-bit
    U64(u64),
    /// Double-precision float
    F64(f64),
    /// UTF-8 string
    Str(String),
    /// Opaque bytes
    Bytes(Vec<u8>),
}

// ============================================================================
// Nodes
// ============================================================================

/// One typed node of a pipeline graph.
pub struct GraphNode {
    kind: String,
    name: String,
    properties: IndexMap<String, PropertyValue>,
    pads: Vec<Pad>,
    behaviour: Option<Box<dyn NodeBehaviour>>,
    state: NodeState,
}

impl GraphNode {
    /// Create a node of `kind` named `name` with no pads or properties.
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            properties: IndexMap::new(),
            pads: Vec::new(),
            behaviour: None,
            state: NodeState::Null,
        }
    }

    /// Add a typed property. Insertion order is preserved and significant
    /// for serialization.
    #[must_use]
    pub fn with_property(mut self, name: impl Into<String>, value: PropertyValue) -> Self {
        self.properties.insert(name.into(), value);
        self
    }

    /// Add a pad.
    #[must_use]
    pub fn with_pad(
        mut self,
        name: impl Into<String>,
        direction: PadDirection,
        presence: PadPresence,
    ) -> Self {
        self.pads.push(Pad {
            name: name.into(),
            direction,
            presence,
            link: PadLink::Unlinked,
        });
        self
    }

    /// Attach externally supplied behaviour.
    #[must_use]
    pub fn with_behaviour(mut self, behaviour: Box<dyn NodeBehaviour>) -> Self {
        self.behaviour = Some(behaviour);
        self
    }

    /// Add a pad after construction; returns its index.
    pub fn add_pad(
        &mut self,
        name: impl Into<String>,
        direction: PadDirection,
        presence: PadPresence,
    ) -> usize {
        self.pads.push(Pad {
            name: name.into(),
            direction,
            presence,
            link: PadLink::Unlinked,
        });
        self.pads.len() - 1
    }

    /// The node's kind name.
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The node's instance name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Properties in insertion order.
    #[must_use]
    pub fn properties(&self) -> &IndexMap<String, PropertyValue> {
        &self.properties
    }

    /// Set (or overwrite) a property.
    pub fn set_property(&mut self, name: impl Into<String>, value: PropertyValue) {
        self.properties.insert(name.into(), value);
    }

    /// The node's pads.
    #[must_use]
    pub fn pads(&self) -> &[Pad] {
        &self.pads
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> NodeState {
        self.state
    }
}

impl std::fmt::Debug for GraphNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphNode")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("properties", &self.properties.len())
            .field("pads", &self.pads.len())
            .field("state", &self.state)
            .finish()
    }
}

// ============================================================================
// Graph
// ============================================================================

/// A directed graph of typed nodes connected by typed pads.
///
/// Node order is insertion order and is the stable enumeration order used
/// for serialization.
#[derive(Debug)]
pub struct Graph {
    nodes: Vec<GraphNode>,
    bus: EventBus,
    drain: Option<EventDrain>,
    state: NodeState,
}

impl Graph {
    /// Create an empty graph with a fresh event bus.
    #[must_use]
    pub fn new() -> Self {
        let (bus, drain) = EventBus::channel();
        Self {
            nodes: Vec::new(),
            bus,
            drain: Some(drain),
            state: NodeState::Null,
        }
    }

    /// Add a node; returns its index.
    pub fn add_node(&mut self, node: GraphNode) -> usize {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    /// Number of nodes.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All nodes in insertion order.
    #[must_use]
    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    /// One node by index.
    #[must_use]
    pub fn node(&self, index: usize) -> Option<&GraphNode> {
        self.nodes.get(index)
    }

    /// One node by index, mutable.
    pub fn node_mut(&mut self, index: usize) -> Option<&mut GraphNode> {
        self.nodes.get_mut(index)
    }

    /// Find a node index by instance name.
    #[must_use]
    pub fn find_node(&self, name: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.name == name)
    }

    /// One pad by handle.
    #[must_use]
    pub fn pad(&self, handle: PadHandle) -> Option<&Pad> {
        self.nodes.get(handle.node)?.pads.get(handle.pad)
    }

    fn pad_mut(&mut self, handle: PadHandle) -> Option<&mut Pad> {
        self.nodes.get_mut(handle.node)?.pads.get_mut(handle.pad)
    }

    fn describe_pad(&self, handle: PadHandle) -> String {
        match (self.node(handle.node), self.pad(handle)) {
            (Some(node), Some(pad)) => format!("{}:{}", node.name, pad.name),
            _ => format!("<invalid pad {:?}>", handle),
        }
    }

    /// Link a source pad to a sink pad inside this graph.
    pub fn link(&mut self, src: PadHandle, sink: PadHandle) -> Result<()> {
        let src_pad = self
            .pad(src)
            .ok_or_else(|| Error::Graph(format!("no such pad {:?}", src)))?;
        let sink_pad = self
            .pad(sink)
            .ok_or_else(|| Error::Graph(format!("no such pad {:?}", sink)))?;
        if src_pad.direction != PadDirection::Source {
            return Err(Error::Graph(format!(
                "{} is not a source pad",
                self.describe_pad(src)
            )));
        }
        if sink_pad.direction != PadDirection::Sink {
            return Err(Error::Graph(format!(
                "{} is not a sink pad",
                self.describe_pad(sink)
            )));
        }
        if src_pad.link != PadLink::Unlinked || sink_pad.link != PadLink::Unlinked {
            return Err(Error::Graph(format!(
                "{} -> {} would double-link a pad",
                self.describe_pad(src),
                self.describe_pad(sink)
            )));
        }
        if let Some(pad) = self.pad_mut(src) {
            pad.link = PadLink::Internal(sink);
        }
        if let Some(pad) = self.pad_mut(sink) {
            pad.link = PadLink::Internal(src);
        }
        Ok(())
    }

    /// Mark a pad as linked to something outside this graph. Such pads are
    /// serialized as boundary pads and surfaced as connection candidates.
    pub fn mark_external(&mut self, handle: PadHandle) -> Result<()> {
        let pad = self
            .pad_mut(handle)
            .ok_or_else(|| Error::Graph(format!("no such pad {:?}", handle)))?;
        if pad.link != PadLink::Unlinked {
            return Err(Error::Graph(format!(
                "pad {:?} is already linked",
                handle
            )));
        }
        pad.link = PadLink::External;
        Ok(())
    }

    /// All linked pads (internal or external) in stable enumeration order:
    /// node insertion order, then pad order within each node.
    #[must_use]
    pub fn linked_pads(&self) -> Vec<PadHandle> {
        let mut handles = Vec::new();
        for (node_index, node) in self.nodes.iter().enumerate() {
            for (pad_index, pad) in node.pads.iter().enumerate() {
                if pad.link != PadLink::Unlinked {
                    handles.push(PadHandle {
                        node: node_index,
                        pad: pad_index,
                    });
                }
            }
        }
        handles
    }

    /// The bus nodes post events to.
    #[must_use]
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Take the draining side of the bus. Whoever runs the graph owns it.
    pub fn take_drain(&mut self) -> Option<EventDrain> {
        self.drain.take()
    }

    /// The graph-level lifecycle state (the last transition target applied).
    #[must_use]
    pub fn state(&self) -> NodeState {
        self.state
    }

    /// Drive every node through `transition` and aggregate the outcomes.
    ///
    /// Posts a StateChanged event per node. A Failure from any node
    /// dominates the aggregate but does not stop the sweep.
    pub fn set_state(&mut self, transition: StateTransition) -> StateChangeOutcome {
        let mut aggregate = StateChangeOutcome::Success;
        let bus = self.bus.clone();
        for node in &mut self.nodes {
            let outcome = match node.behaviour.as_mut() {
                Some(behaviour) => behaviour.change_state(transition, &bus),
                None => StateChangeOutcome::Success,
            };
            if outcome != StateChangeOutcome::Failure {
                node.state = transition.target();
            }
            bus.post(GraphEvent::StateChanged {
                node: node.name.clone(),
                transition,
                outcome,
            });
            aggregate = aggregate.combine(outcome);
        }
        if aggregate != StateChangeOutcome::Failure {
            self.state = transition.target();
        }
        debug!(?transition, ?aggregate, nodes = self.nodes.len(), "graph state change");
        aggregate
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}
