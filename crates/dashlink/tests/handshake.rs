// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! End-to-end handshake tests: host and remote halves wired over the
//! in-process loopback transport.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use dashlink::comms::{CommsChannel, LoopbackIo};
use dashlink::graph::{
    EventBus, Graph, GraphEvent, GraphNode, KindRegistry, NodeBehaviour, PadDirection, PadHandle,
    PadPresence, PropertyValue, StateChangeOutcome, StateTransition,
};
use dashlink::offload::{
    ChannelArena, HeartbeatConfig, InstanceParams, LogMode, OffloadHost, OffloadHostConfig,
    RemoteInstance, RemoteInstanceConfig,
};
use dashlink::Error;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Node behaviour that reaches EOS as soon as it starts playing.
struct EosAtPlaying {
    name: String,
}

impl NodeBehaviour for EosAtPlaying {
    fn change_state(&mut self, transition: StateTransition, bus: &EventBus) -> StateChangeOutcome {
        if transition == StateTransition::PausedToPlaying {
            bus.post(GraphEvent::Eos {
                node: self.name.clone(),
            });
        }
        StateChangeOutcome::Success
    }
}

fn streamer_registry() -> Arc<KindRegistry> {
    let registry = KindRegistry::new();
    registry.register("streamer", |name| {
        Box::new(EosAtPlaying {
            name: name.to_string(),
        })
    });
    Arc::new(registry)
}

fn fast_remote_config() -> RemoteInstanceConfig {
    RemoteInstanceConfig {
        heartbeat: HeartbeatConfig {
            interval: Duration::from_millis(50),
            timeout: Duration::from_secs(2),
        },
        ready_ack_timeout: Duration::from_secs(5),
    }
}

fn arena_with(channel: CommsChannel) -> ChannelArena {
    let mut arena = ChannelArena::new();
    arena.insert(0, Arc::new(channel));
    arena
}

/// Host half plus a running remote half, connected over loopback.
fn wired(registry: Arc<KindRegistry>) -> (OffloadHost, JoinHandle<dashlink::Result<()>>) {
    let (host_io, remote_io) = LoopbackIo::pair();
    let host = OffloadHost::new(
        arena_with(CommsChannel::new("host-default", Arc::new(host_io))),
        OffloadHostConfig::default(),
    )
    .unwrap();
    let remote = RemoteInstance::new(
        arena_with(CommsChannel::new("remote-default", Arc::new(remote_io))),
        registry,
        fast_remote_config(),
    )
    .unwrap();
    let remote_thread = thread::spawn(move || remote.run());
    (host, remote_thread)
}

/// Single "streamer" node whose source pad is a boundary pad: zero ingress.
fn egress_only_graph() -> Graph {
    let mut graph = Graph::new();
    let node = graph.add_node(
        GraphNode::new("streamer", "stream0")
            .with_property("bitrate", PropertyValue::U32(2_000_000))
            .with_pad("out", PadDirection::Source, PadPresence::Always),
    );
    graph.mark_external(PadHandle { node, pad: 0 }).unwrap();
    graph
}

/// Single "streamer" node whose sink pad is a boundary pad: one ingress.
fn ingress_graph() -> Graph {
    let mut graph = Graph::new();
    let node = graph.add_node(
        GraphNode::new("streamer", "stream0")
            .with_pad("in", PadDirection::Sink, PadPresence::Always),
    );
    graph.mark_external(PadHandle { node, pad: 0 }).unwrap();
    graph
}

fn wait_until(timeout: Duration, predicate: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    predicate()
}

#[test]
fn test_full_handshake_run_and_teardown() {
    let (host, remote_thread) = wired(streamer_registry());
    let eos_count = Arc::new(AtomicUsize::new(0));
    {
        let eos_count = Arc::clone(&eos_count);
        host.set_eos_callback(move || {
            eos_count.fetch_add(1, Ordering::SeqCst);
        });
    }

    host.wait_remote_ready().unwrap();
    host.send_params(&InstanceParams {
        log_mode: LogMode::Local,
        debug_string: Some("dashlink=debug".to_string()),
    })
    .unwrap();

    let graph = egress_only_graph();
    let candidates = host.transfer_graph(&graph).unwrap();
    assert_eq!(candidates.len(), 1);

    assert_eq!(
        host.set_remote_state(StateTransition::ReadyToPaused).unwrap(),
        StateChangeOutcome::Success
    );
    assert_eq!(
        host.set_remote_state(StateTransition::PausedToPlaying)
            .unwrap(),
        StateChangeOutcome::Success
    );

    // Zero ingress boundary pads: the remote notification alone opens the latch
    assert!(wait_until(Duration::from_secs(5), || {
        eos_count.load(Ordering::SeqCst) == 1
    }));

    host.set_remote_state(StateTransition::PlayingToPaused)
        .unwrap();
    host.set_remote_state(StateTransition::PausedToReady).unwrap();
    assert_eq!(host.teardown().unwrap(), StateChangeOutcome::Success);

    remote_thread.join().unwrap().unwrap();
    assert!(!host.has_failed());
}

#[test]
fn test_eos_latch_waits_for_local_eos_remote_first() {
    let (host, remote_thread) = wired(streamer_registry());
    let eos_count = Arc::new(AtomicUsize::new(0));
    {
        let eos_count = Arc::clone(&eos_count);
        host.set_eos_callback(move || {
            eos_count.fetch_add(1, Ordering::SeqCst);
        });
    }

    host.wait_remote_ready().unwrap();
    host.send_params(&InstanceParams::default()).unwrap();
    host.transfer_graph(&ingress_graph()).unwrap();

    host.set_remote_state(StateTransition::ReadyToPaused).unwrap();
    host.set_remote_state(StateTransition::PausedToPlaying)
        .unwrap();

    // Remote EOS arrives, but one ingress boundary pad means the latch must
    // also see a local EOS
    thread::sleep(Duration::from_millis(300));
    assert_eq!(eos_count.load(Ordering::SeqCst), 0);

    host.notify_local_eos();
    assert!(wait_until(Duration::from_secs(2), || {
        eos_count.load(Ordering::SeqCst) == 1
    }));

    host.set_remote_state(StateTransition::PlayingToPaused)
        .unwrap();
    host.set_remote_state(StateTransition::PausedToReady).unwrap();
    host.teardown().unwrap();
    remote_thread.join().unwrap().unwrap();
}

#[test]
fn test_eos_latch_waits_for_remote_eos_local_first() {
    let (host, remote_thread) = wired(streamer_registry());
    let eos_count = Arc::new(AtomicUsize::new(0));
    {
        let eos_count = Arc::clone(&eos_count);
        host.set_eos_callback(move || {
            eos_count.fetch_add(1, Ordering::SeqCst);
        });
    }

    host.wait_remote_ready().unwrap();
    host.send_params(&InstanceParams::default()).unwrap();
    host.transfer_graph(&ingress_graph()).unwrap();
    host.set_remote_state(StateTransition::ReadyToPaused).unwrap();

    // Local EOS first; the latch stays closed until the remote reports too
    host.notify_local_eos();
    thread::sleep(Duration::from_millis(200));
    assert_eq!(eos_count.load(Ordering::SeqCst), 0);

    host.set_remote_state(StateTransition::PausedToPlaying)
        .unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        eos_count.load(Ordering::SeqCst) == 1
    }));

    host.set_remote_state(StateTransition::PlayingToPaused)
        .unwrap();
    host.set_remote_state(StateTransition::PausedToReady).unwrap();
    host.teardown().unwrap();
    remote_thread.join().unwrap().unwrap();
}

#[test]
fn test_fatal_escalation_is_idempotent_across_channels() {
    let (host_io_a, peer_io_a) = LoopbackIo::pair();
    let (host_io_b, peer_io_b) = LoopbackIo::pair();
    let mut arena = ChannelArena::new();
    arena.insert(
        0,
        Arc::new(CommsChannel::new("host-default", Arc::new(host_io_a))),
    );
    arena.insert(1, Arc::new(CommsChannel::new("host-aux", Arc::new(host_io_b))));
    let host = OffloadHost::new(arena, OffloadHostConfig::default()).unwrap();

    let fatal_count = Arc::new(AtomicUsize::new(0));
    {
        let fatal_count = Arc::clone(&fatal_count);
        host.set_fatal_callback(move |_| {
            fatal_count.fetch_add(1, Ordering::SeqCst);
        });
    }

    let peer_a = CommsChannel::new("peer-a", Arc::new(peer_io_a));
    let peer_b = CommsChannel::new("peer-b", Arc::new(peer_io_b));

    // Two channels fail back to back; the instance escalates once
    peer_a.error_state();
    peer_b.error_state();

    assert!(wait_until(Duration::from_secs(2), || host.has_failed()));
    thread::sleep(Duration::from_millis(100));
    assert_eq!(fatal_count.load(Ordering::SeqCst), 1);
    assert!(host.channel(0).unwrap().has_failed());
    assert!(host.channel(1).unwrap().has_failed());
}

#[test]
fn test_ready_wait_times_out_without_a_remote() {
    let (host_io, _unused_remote_io) = LoopbackIo::pair();
    let host = OffloadHost::new(
        arena_with(CommsChannel::new("host-default", Arc::new(host_io))),
        OffloadHostConfig {
            ready_timeout: Duration::from_millis(100),
            ..OffloadHostConfig::default()
        },
    )
    .unwrap();
    let start = Instant::now();
    let err = host.wait_remote_ready().unwrap_err();
    assert!(matches!(err, Error::HandshakeTimeout { .. }));
    assert!(start.elapsed() >= Duration::from_millis(100));
}

#[test]
fn test_graph_transfer_fails_on_unknown_kind() {
    // Remote registry does not know the "streamer" kind
    let empty_registry = Arc::new(KindRegistry::new());
    let (host, remote_thread) = wired(empty_registry);

    host.wait_remote_ready().unwrap();
    host.send_params(&InstanceParams::default()).unwrap();
    let err = host.transfer_graph(&egress_only_graph()).unwrap_err();
    assert!(matches!(err, Error::RemoteFailure(_)));

    // Graph reconstruction failure is terminal for the remote instance
    let remote_result = remote_thread.join().unwrap();
    assert!(remote_result.is_err());
}

#[test]
fn test_params_reach_the_remote_handler() {
    let (host_io, remote_io) = LoopbackIo::pair();
    let host = OffloadHost::new(
        arena_with(CommsChannel::new("host-default", Arc::new(host_io))),
        OffloadHostConfig::default(),
    )
    .unwrap();
    let remote = RemoteInstance::new(
        arena_with(CommsChannel::new("remote-default", Arc::new(remote_io))),
        streamer_registry(),
        fast_remote_config(),
    )
    .unwrap();

    let seen: Arc<Mutex<Option<InstanceParams>>> = Arc::new(Mutex::new(None));
    {
        let seen = Arc::clone(&seen);
        remote.set_params_handler(move |params| {
            *seen.lock().unwrap() = Some(params.clone());
        });
    }
    let remote_thread = thread::spawn(move || remote.run());

    host.wait_remote_ready().unwrap();
    let params = InstanceParams {
        log_mode: LogMode::Buffered,
        debug_string: Some("dashlink=trace".to_string()),
    };
    host.send_params(&params).unwrap();
    assert_eq!(seen.lock().unwrap().clone(), Some(params));

    host.transfer_graph(&egress_only_graph()).unwrap();
    host.teardown().unwrap();
    remote_thread.join().unwrap().unwrap();
}

#[test]
fn test_remote_forwards_node_errors_as_informational() {
    // A behaviour that reports a node error when asked to pause
    struct ErrorAtPaused {
        name: String,
    }
    impl NodeBehaviour for ErrorAtPaused {
        fn change_state(
            &mut self,
            transition: StateTransition,
            bus: &EventBus,
        ) -> StateChangeOutcome {
            if transition == StateTransition::ReadyToPaused {
                bus.post(GraphEvent::Error {
                    node: self.name.clone(),
                    message: "no upstream data".to_string(),
                });
            }
            StateChangeOutcome::Success
        }
    }

    let registry = KindRegistry::new();
    registry.register("grumbler", |name| {
        Box::new(ErrorAtPaused {
            name: name.to_string(),
        })
    });
    let (host, remote_thread) = wired(Arc::new(registry));

    let messages: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let messages = Arc::clone(&messages);
        host.set_remote_error_callback(move |message| {
            messages.lock().unwrap().push(message);
        });
    }

    host.wait_remote_ready().unwrap();
    host.send_params(&InstanceParams::default()).unwrap();

    let mut graph = Graph::new();
    let node = graph.add_node(
        GraphNode::new("grumbler", "grumbler0")
            .with_pad("out", PadDirection::Source, PadPresence::Always),
    );
    graph.mark_external(PadHandle { node, pad: 0 }).unwrap();
    host.transfer_graph(&graph).unwrap();

    host.set_remote_state(StateTransition::ReadyToPaused).unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        messages
            .lock()
            .unwrap()
            .iter()
            .any(|m| m.contains("no upstream data"))
    }));
    // Informational: the instance did not escalate
    assert!(!host.has_failed());

    host.set_remote_state(StateTransition::PausedToReady).unwrap();
    host.teardown().unwrap();
    remote_thread.join().unwrap().unwrap();
}
