//! Two engines talking over one in-memory medium.

mod common;

use common::{memory_entry, test_config, MemoryTransport, Medium, SharedMedium};
use sbn::bus::PipeId;
use sbn::{BusMessage, Engine, EngineConfig, LocalBus, PeerState, SenderId, SoftwareBus, TransportRegistry};
use std::sync::{Arc, Mutex};

struct Node {
    engine: Engine<LocalBus>,
    bus: LocalBus,
}

impl Node {
    fn new(config: EngineConfig, medium: &SharedMedium) -> Self {
        let mut transports = TransportRegistry::new();
        transports.register(Box::new(MemoryTransport::new(Arc::clone(medium))));
        let entries = vec![memory_entry(1, "CPU1", 1), memory_entry(2, "CPU2", 2)];
        let bus = LocalBus::new();
        let engine = Engine::new(config, bus.clone(), transports, entries).unwrap();
        Self { engine, bus }
    }

    fn peer_state(&self) -> PeerState {
        self.engine.peers().get(0).unwrap().state
    }
}

fn pair() -> (Node, Node) {
    let medium: SharedMedium = Arc::new(Mutex::new(Medium::default()));
    let a = Node::new(test_config(), &medium);
    let b = Node::new(EngineConfig { cpu_id: 2, cpu_name: "CPU2".into(), ..test_config() }, &medium);
    (a, b)
}

fn connected_pair() -> (Node, Node) {
    let (mut a, mut b) = pair();
    a.engine.tick(0);
    b.engine.tick(0);
    a.engine.tick(1);
    (a, b)
}

#[test]
fn engines_find_each_other() {
    let (mut a, mut b) = pair();
    assert_eq!(a.peer_state(), PeerState::Announcing);
    assert_eq!(b.peer_state(), PeerState::Announcing);

    a.engine.tick(0);
    b.engine.tick(0);
    assert_eq!(b.peer_state(), PeerState::Heartbeating);
    a.engine.tick(1);
    assert_eq!(a.peer_state(), PeerState::Heartbeating);
}

#[test]
fn subscriptions_and_data_cross_the_link() {
    let (mut a, mut b) = connected_pair();

    let app = b.bus.create_pipe("APP", 8).unwrap();
    b.bus.subscribe(0x0950, app).unwrap();
    b.engine.tick(2);
    a.engine.tick(2);
    assert!(a.engine.peers().get(0).unwrap().has_sub(0x0950));

    a.bus
        .send(BusMessage::new(0x0950, vec![0xAB, 0xCD], SenderId::App("SRC".into())))
        .unwrap();
    a.engine.tick(3);
    b.engine.tick(3);

    let got = receive_all(&mut b.bus, app);
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].msg_id, 0x0950);
    assert_eq!(got[0].payload, vec![0xAB, 0xCD]);
    assert_eq!(got[0].sender, SenderId::Network { cpu_id: 1 });

    // B must not bounce it back.
    b.engine.tick(4);
    a.engine.tick(4);
    assert_eq!(a.engine.peers().get(0).unwrap().counters.app_msg_recv, 0);
}

#[test]
fn silent_peer_is_dropped_with_its_subscriptions() {
    let (mut a, mut b) = connected_pair();
    let app = b.bus.create_pipe("APP", 8).unwrap();
    b.bus.subscribe(0x0951, app).unwrap();
    b.engine.tick(2);
    a.engine.tick(2);
    assert_eq!(a.bus.subscribers(0x0951).len(), 1);

    // B goes quiet; A last heard from it at 2.
    for now in 3..=12 {
        a.engine.tick(now);
    }
    assert_eq!(a.peer_state(), PeerState::Heartbeating);

    a.engine.tick(13);
    assert_eq!(a.peer_state(), PeerState::Announcing);
    assert!(!a.engine.peers().get(0).unwrap().has_sub(0x0951));
    assert!(a.bus.subscribers(0x0951).is_empty());
}

fn receive_all(bus: &mut LocalBus, pipe: PipeId) -> Vec<BusMessage> {
    let mut out = Vec::new();
    while let Ok(msg) = bus.receive(pipe) {
        out.push(msg);
    }
    out
}
