// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Node construction by kind name.
//!
//! The decode side of the codec reconstructs nodes it has never seen; the
//! [`NodeFactory`] supplies the behaviour for a declared kind, and an
//! unrecognized kind fails the whole decode.

use super::bus::EventBus;
use super::{StateChangeOutcome, StateTransition};
use dashmap::DashMap;

/// Externally supplied node logic.
///
/// The protocol layer only ever drives lifecycle transitions; data flow
/// through the node is the embedding runtime's business.
pub trait NodeBehaviour: Send {
    /// Run one lifecycle transition. Behaviours may post node-level events
    /// to the bus while transitioning.
    fn change_state(&mut self, transition: StateTransition, bus: &EventBus) -> StateChangeOutcome {
        let _ = (transition, bus);
        StateChangeOutcome::Success
    }
}

/// A behaviour that accepts every transition and does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct InertBehaviour;

impl NodeBehaviour for InertBehaviour {}

/// Constructs node behaviour by kind name. `None` means the kind is unknown.
pub trait NodeFactory: Send + Sync {
    /// Create the behaviour for a node of `kind` with instance name `name`.
    fn create(&self, kind: &str, name: &str) -> Option<Box<dyn NodeBehaviour>>;
}

/// Constructor for one registered kind; receives the instance name.
pub type BehaviourCtor = Box<dyn Fn(&str) -> Box<dyn NodeBehaviour> + Send + Sync>;

/// A registry of known node kinds.
#[derive(Default)]
pub struct KindRegistry {
    ctors: DashMap<String, BehaviourCtor>,
}

impl KindRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor for `kind`.
    pub fn register(
        &self,
        kind: impl Into<String>,
        ctor: impl Fn(&str) -> Box<dyn NodeBehaviour> + Send + Sync + 'static,
    ) {
        self.ctors.insert(kind.into(), Box::new(ctor));
    }

    /// Register `kind` with inert behaviour.
    pub fn register_inert(&self, kind: impl Into<String>) {
        self.register(kind, |_| Box::new(InertBehaviour));
    }

    /// Whether `kind` is registered.
    #[must_use]
    pub fn knows(&self, kind: &str) -> bool {
        self.ctors.contains_key(kind)
    }
}

impl NodeFactory for KindRegistry {
    fn create(&self, kind: &str, name: &str) -> Option<Box<dyn NodeBehaviour>> {
        self.ctors.get(kind).map(|ctor| (ctor.value())(name))
    }
}

impl std::fmt::Debug for KindRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KindRegistry")
            .field("kinds", &self.ctors.len())
            .finish()
    }
}

/// A factory that accepts every kind with inert behaviour. Bring-up and
/// codec-test helper; production decodes want a real [`KindRegistry`].
#[derive(Debug, Default, Clone, Copy)]
pub struct AnyKindFactory;

impl NodeFactory for AnyKindFactory {
    fn create(&self, _kind: &str, _name: &str) -> Option<Box<dyn NodeBehaviour>> {
        Some(Box::new(InertBehaviour))
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_creates_known_kind() {
        let registry = KindRegistry::new();
        registry.register_inert("filter");
        assert!(registry.knows("filter"));
        assert!(registry.create("filter", "filter0").is_some());
    }

    #[test]
    fn test_registry_rejects_unknown_kind() {
        let registry = KindRegistry::new();
        assert!(registry.create("mystery", "m0").is_none());
    }

    #[test]
    fn test_any_kind_factory_accepts_everything() {
        assert!(AnyKindFactory.create("whatever", "w0").is_some());
    }
}
