//! Link technologies behind one operation table.
//!
//! Each transport owns the interfaces (hosts and peers) that use it and
//! hands out an [`InterfaceId`] per peer-file entry it accepted. The engine
//! never looks inside an interface; it only goes through [`Transport`].

pub mod serial;
pub mod shmem;
pub mod spacewire;
pub mod udp;

use crate::peer::{InterfaceId, InterfaceIdentity, PeerName};
use crate::wire::{CpuId, Frame, WireError};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

pub use serial::SerialTransport;
pub use shmem::ShmemTransport;
pub use spacewire::SpaceWireTransport;
pub use udp::UdpTransport;

pub const PROTOCOL_IPV4: u8 = 1;
pub const PROTOCOL_SPACEWIRE_PKT: u8 = 4;
pub const PROTOCOL_SHMEM: u8 = 5;
pub const PROTOCOL_SERIAL: u8 = 6;

/// Human-readable name of a protocol id, if this crate implements it.
pub fn protocol_name(protocol_id: u8) -> Option<&'static str> {
    match protocol_id {
        PROTOCOL_IPV4 => Some("IPv4"),
        PROTOCOL_SPACEWIRE_PKT => Some("SpaceWire"),
        PROTOCOL_SHMEM => Some("ShMem"),
        PROTOCOL_SERIAL => Some("Serial"),
        _ => None,
    }
}

/// Whether an interface is this node's endpoint or a remote node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InterfaceRole {
    Host,
    Peer,
}

/// Who "we" are, for host/peer classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    pub cpu_id: CpuId,
    pub cpu_name: PeerName,
}

/// Transport-specific status returned for GetPeerStatus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleStatus {
    pub protocol_id: u8,
    pub detail: String,
    #[serde(with = "serde_bytes")]
    pub raw: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
    #[error("peer file entry expects {expected} protocol fields, found {found}")]
    FieldCount { expected: usize, found: usize },
    #[error("invalid {field}: {value:?}")]
    BadField { field: &'static str, value: String },
    #[error("no interface {0}")]
    UnknownInterface(InterfaceId),
    #[error("interface {0} is not initialised as the right role")]
    WrongRole(InterfaceId),
    #[error("no host available for this link")]
    NoHost,
    #[error("shared memory ring full")]
    RingFull,
    #[error("shared memory ring of {len} bytes is too small or misaligned")]
    BadRing { len: usize },
    #[error("link down")]
    LinkDown,
    #[error("not implemented by this transport")]
    NotImplemented,
}

impl TransportError {
    pub fn is_not_implemented(&self) -> bool {
        matches!(self, TransportError::NotImplemented)
    }
}

pub trait Transport: Send {
    fn protocol_id(&self) -> u8;

    fn name(&self) -> &'static str;

    /// Parses the protocol-specific tail of a peer-file entry and stores it.
    fn load_entry(&mut self, identity: &InterfaceIdentity, fields: &[&str]) -> Result<InterfaceId, TransportError>;

    /// Classifies an entry as host or peer and prepares it (binds sockets,
    /// opens devices, maps segments).
    fn init_interface(&mut self, id: InterfaceId, local: &LocalIdentity) -> Result<InterfaceRole, TransportError>;

    /// Sends one frame to a peer, returning the bytes written.
    fn send(&mut self, peer: InterfaceId, frame: &Frame) -> Result<usize, TransportError>;

    /// Polls a host for one frame. `WouldBlock` means nothing is waiting.
    fn receive(&mut self, host: InterfaceId) -> nb::Result<Frame, TransportError>;

    /// True when `peer` has a host of this transport it can be reached through.
    fn verify_peer(&mut self, peer: InterfaceId, hosts: &[InterfaceId]) -> bool;

    /// True when `host` has a peer to serve. May start background work.
    fn verify_host(&mut self, host: InterfaceId, peers: &[InterfaceId]) -> bool;

    fn report_status(&mut self, _peer: InterfaceId, _hosts: &[InterfaceId]) -> Result<ModuleStatus, TransportError> {
        Err(TransportError::NotImplemented)
    }

    fn reset_peer(&mut self, _peer: InterfaceId, _hosts: &[InterfaceId]) -> Result<(), TransportError> {
        Err(TransportError::NotImplemented)
    }

    /// Stops background work and releases devices.
    fn shutdown(&mut self) {}
}

/// Transports known to the engine, looked up by protocol id.
#[derive(Default)]
pub struct TransportRegistry {
    transports: Vec<Box<dyn Transport>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every link technology this crate implements.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(UdpTransport::new()));
        registry.register(Box::new(SpaceWireTransport::new()));
        registry.register(Box::new(ShmemTransport::new()));
        registry.register(Box::new(SerialTransport::new()));
        registry
    }

    /// Registers a transport, replacing any previous one with the same id.
    pub fn register(&mut self, transport: Box<dyn Transport>) {
        let id = transport.protocol_id();
        self.transports.retain(|t| t.protocol_id() != id);
        self.transports.push(transport);
    }

    pub fn contains(&self, protocol_id: u8) -> bool {
        self.transports.iter().any(|t| t.protocol_id() == protocol_id)
    }

    pub fn get_mut(&mut self, protocol_id: u8) -> Option<&mut (dyn Transport + 'static)> {
        self.transports
            .iter_mut()
            .find(|t| t.protocol_id() == protocol_id)
            .map(|t| t.as_mut())
    }

    pub fn protocol_ids(&self) -> Vec<u8> {
        self.transports.iter().map(|t| t.protocol_id()).collect()
    }

    pub fn shutdown(&mut self) {
        for transport in &mut self.transports {
            transport.shutdown();
        }
    }
}

impl core::fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_list().entries(self.transports.iter().map(|t| t.name())).finish()
    }
}

/// Checks the protocol field count of a peer-file entry.
pub(crate) fn expect_fields(fields: &[&str], expected: usize) -> Result<(), TransportError> {
    if fields.len() != expected {
        return Err(TransportError::FieldCount { expected, found: fields.len() });
    }
    Ok(())
}

pub(crate) fn parse_field<T: FromStr>(value: &str, field: &'static str) -> Result<T, TransportError> {
    value.parse().map_err(|_| TransportError::BadField { field, value: value.to_string() })
}
