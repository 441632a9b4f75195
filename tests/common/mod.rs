#![allow(dead_code)]

use sbn::bus::PipeId;
use sbn::peer::{InterfaceId, InterfaceIdentity, PeerName};
use sbn::peer_file::PeerFileEntry;
use sbn::transport::{InterfaceRole, LocalIdentity, ModuleStatus, Transport, TransportError, TransportRegistry};
use sbn::wire::{CpuId, Frame, MsgId, MsgType, Qos};
use sbn::{BusMessage, Engine, EngineConfig, LocalBus, SenderId, SoftwareBus};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

pub const PROTOCOL_MEMORY: u8 = 200;
pub const LOCAL_CPU: CpuId = 1;
pub const LOCAL_NAME: &str = "CPU1";

/// Everything sent over the in-memory links, keyed by destination address.
#[derive(Debug, Default)]
pub struct Medium {
    pub inboxes: HashMap<String, VecDeque<Frame>>,
    pub resets: Vec<String>,
    pub fail_sends: bool,
    pub status_supported: bool,
}

pub type SharedMedium = Arc<Mutex<Medium>>;

#[derive(Debug)]
struct MemoryInterface {
    name: PeerName,
    address: String,
    role: Option<InterfaceRole>,
}

/// A transport whose "wire" is a set of in-memory inboxes. Hosts read the
/// inbox named by their address; sends land in the peer's inbox.
#[derive(Debug)]
pub struct MemoryTransport {
    medium: SharedMedium,
    interfaces: Vec<MemoryInterface>,
}

impl MemoryTransport {
    pub fn new(medium: SharedMedium) -> Self {
        Self { medium, interfaces: Vec::new() }
    }
}

impl Transport for MemoryTransport {
    fn protocol_id(&self) -> u8 {
        PROTOCOL_MEMORY
    }

    fn name(&self) -> &'static str {
        "Memory"
    }

    fn load_entry(&mut self, identity: &InterfaceIdentity, fields: &[&str]) -> Result<InterfaceId, TransportError> {
        if fields.len() != 1 {
            return Err(TransportError::FieldCount { expected: 1, found: fields.len() });
        }
        self.interfaces.push(MemoryInterface { name: identity.name, address: fields[0].to_string(), role: None });
        Ok(self.interfaces.len() - 1)
    }

    fn init_interface(&mut self, id: InterfaceId, local: &LocalIdentity) -> Result<InterfaceRole, TransportError> {
        let iface = self.interfaces.get_mut(id).ok_or(TransportError::UnknownInterface(id))?;
        let role = if iface.name == local.cpu_name { InterfaceRole::Host } else { InterfaceRole::Peer };
        iface.role = Some(role);
        Ok(role)
    }

    fn send(&mut self, peer: InterfaceId, frame: &Frame) -> Result<usize, TransportError> {
        let iface = self.interfaces.get(peer).ok_or(TransportError::UnknownInterface(peer))?;
        let mut medium = self.medium.lock().unwrap();
        if medium.fail_sends {
            return Err(TransportError::LinkDown);
        }
        medium.inboxes.entry(iface.address.clone()).or_default().push_back(frame.clone());
        Ok(frame.encoded_len())
    }

    fn receive(&mut self, host: InterfaceId) -> nb::Result<Frame, TransportError> {
        let iface = self.interfaces.get(host).ok_or(TransportError::UnknownInterface(host))?;
        let mut medium = self.medium.lock().unwrap();
        medium
            .inboxes
            .get_mut(&iface.address)
            .and_then(|q| q.pop_front())
            .ok_or(nb::Error::WouldBlock)
    }

    fn verify_peer(&mut self, _peer: InterfaceId, hosts: &[InterfaceId]) -> bool {
        !hosts.is_empty()
    }

    fn verify_host(&mut self, _host: InterfaceId, _peers: &[InterfaceId]) -> bool {
        true
    }

    fn report_status(&mut self, peer: InterfaceId, _hosts: &[InterfaceId]) -> Result<ModuleStatus, TransportError> {
        let iface = self.interfaces.get(peer).ok_or(TransportError::UnknownInterface(peer))?;
        if !self.medium.lock().unwrap().status_supported {
            return Err(TransportError::NotImplemented);
        }
        Ok(ModuleStatus { protocol_id: PROTOCOL_MEMORY, detail: iface.address.clone(), raw: vec![1] })
    }

    fn reset_peer(&mut self, peer: InterfaceId, _hosts: &[InterfaceId]) -> Result<(), TransportError> {
        let iface = self.interfaces.get(peer).ok_or(TransportError::UnknownInterface(peer))?;
        self.medium.lock().unwrap().resets.push(iface.address.clone());
        Ok(())
    }
}

pub fn identity(name: &str, cpu: CpuId, protocol_id: u8) -> InterfaceIdentity {
    InterfaceIdentity { name: PeerName::from(name).unwrap(), processor_id: cpu, protocol_id, spacecraft_id: 0x42, qos: 0 }
}

/// A memory-transport entry whose address is the lowercase name.
pub fn memory_entry(idx: usize, name: &str, cpu: CpuId) -> PeerFileEntry {
    PeerFileEntry {
        entry: idx,
        identity: identity(name, cpu, PROTOCOL_MEMORY),
        protocol_fields: vec![name.to_lowercase()],
    }
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        cpu_id: LOCAL_CPU,
        cpu_name: LOCAL_NAME.to_string(),
        volatile_peer_file: None,
        nonvolatile_peer_file: None,
        ..EngineConfig::default()
    }
}

pub struct Harness {
    pub engine: Engine<LocalBus>,
    pub bus: LocalBus,
    pub medium: SharedMedium,
}

impl Harness {
    /// Local host CPU1 plus one memory peer per `(name, cpu)`.
    pub fn new(peers: &[(&str, CpuId)]) -> Self {
        Self::with_config(test_config(), peers)
    }

    pub fn with_config(config: EngineConfig, peers: &[(&str, CpuId)]) -> Self {
        Self::with_setup(config, peers, |_| {})
    }

    /// Like [`Harness::with_config`], running `setup` on the bus before the
    /// engine exists.
    pub fn with_setup(config: EngineConfig, peers: &[(&str, CpuId)], setup: impl FnOnce(&mut LocalBus)) -> Self {
        let medium: SharedMedium = Arc::new(Mutex::new(Medium { status_supported: true, ..Medium::default() }));
        let mut transports = TransportRegistry::new();
        transports.register(Box::new(MemoryTransport::new(Arc::clone(&medium))));

        let mut entries = vec![memory_entry(1, LOCAL_NAME, LOCAL_CPU)];
        for (i, (name, cpu)) in peers.iter().enumerate() {
            entries.push(memory_entry(i + 2, name, *cpu));
        }

        let mut bus = LocalBus::new();
        setup(&mut bus);
        let engine = Engine::new(config, bus.clone(), transports, entries).unwrap();
        Self { engine, bus, medium }
    }

    /// Delivers a frame to the local host as if `cpu` had sent it.
    pub fn inject(&self, frame: Frame) {
        self.medium
            .lock()
            .unwrap()
            .inboxes
            .entry(LOCAL_NAME.to_lowercase())
            .or_default()
            .push_back(frame);
    }

    pub fn inject_from(&self, cpu: CpuId, msg_type: MsgType, payload: Vec<u8>) {
        self.inject(Frame::new(msg_type, cpu, payload));
    }

    pub fn inject_sub(&self, cpu: CpuId, msg_type: MsgType, msg_id: MsgId) {
        self.inject_from(cpu, msg_type, sbn::wire::pack_sub(msg_id, Qos::default()).to_vec());
    }

    /// Frames sent to peer `name`, emptying its inbox.
    pub fn take_sent(&self, name: &str) -> Vec<Frame> {
        self.medium
            .lock()
            .unwrap()
            .inboxes
            .get_mut(&name.to_lowercase())
            .map(|q| q.drain(..).collect())
            .unwrap_or_default()
    }

    pub fn take_sent_of(&self, name: &str, msg_type: MsgType) -> Vec<Frame> {
        self.take_sent(name).into_iter().filter(|f| f.msg_type == msg_type).collect()
    }

    /// Brings peer `cpu` up: it announces at `now` and the reply is drained.
    pub fn connect(&mut self, name: &str, cpu: CpuId, now: u64) {
        self.inject_from(cpu, MsgType::Announce, vec![]);
        self.engine.tick(now);
        self.take_sent(name);
    }

    pub fn app_pipe(&mut self, name: &str) -> PipeId {
        self.bus.create_pipe(name, 16).unwrap()
    }

    pub fn publish(&mut self, msg_id: MsgId, payload: Vec<u8>) {
        self.bus.send(BusMessage::new(msg_id, payload, SenderId::App("APP".into()))).unwrap();
    }

    pub fn drain(&mut self, pipe: PipeId) -> Vec<BusMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = self.bus.receive(pipe) {
            out.push(msg);
        }
        out
    }
}
