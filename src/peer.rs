//! Peer registry: one record per remote CPU the engine links to, plus the
//! host interfaces (local endpoints) those links arrive on.

use crate::bus::PipeId;
use crate::wire::{CpuId, MsgId, Qos};
use arrayvec::ArrayString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MAX_PEERNAME_LENGTH: usize = 8;

pub type PeerName = ArrayString<MAX_PEERNAME_LENGTH>;
/// Index of an interface inside its transport's own tables.
pub type InterfaceId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerState {
    Announcing,
    Heartbeating,
}

impl core::fmt::Display for PeerState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            PeerState::Announcing => f.write_str("ANNOUNCING"),
            PeerState::Heartbeating => f.write_str("HEARTBEATING"),
        }
    }
}

/// Identity fields every peer-file entry carries, whatever its protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceIdentity {
    pub name: PeerName,
    pub processor_id: CpuId,
    pub protocol_id: u8,
    pub spacecraft_id: u32,
    pub qos: u8,
}

/// A subscription a peer asked us to forward to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSubscription {
    pub msg_id: MsgId,
    pub qos: Qos,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerCounters {
    pub app_msg_sent: u32,
    pub app_msg_recv: u32,
    pub app_msg_send_err: u32,
    pub app_msg_recv_err: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubTableError {
    #[error("subscription table full ({0} entries)")]
    Full(usize),
    #[error("message 0x{0:04X} already subscribed")]
    Duplicate(MsgId),
}

#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub identity: InterfaceIdentity,
    /// Where this peer lives inside its transport.
    pub interface: InterfaceId,
    pub state: PeerState,
    pub last_sent: Option<u64>,
    pub last_received: Option<u64>,
    pub pipe: PipeId,
    pub in_use: bool,
    pub counters: PeerCounters,
    subs: Vec<RemoteSubscription>,
    max_subs: usize,
}

impl PeerRecord {
    pub fn new(identity: InterfaceIdentity, interface: InterfaceId, pipe: PipeId, max_subs: usize) -> Self {
        Self {
            identity,
            interface,
            state: PeerState::Announcing,
            last_sent: None,
            last_received: None,
            pipe,
            in_use: true,
            counters: PeerCounters::default(),
            subs: Vec::with_capacity(max_subs),
            max_subs,
        }
    }

    pub fn name(&self) -> &str {
        self.identity.name.as_str()
    }

    pub fn cpu_id(&self) -> CpuId {
        self.identity.processor_id
    }

    pub fn protocol_id(&self) -> u8 {
        self.identity.protocol_id
    }

    pub fn is_heartbeating(&self) -> bool {
        self.state == PeerState::Heartbeating
    }

    pub fn sub_count(&self) -> usize {
        self.subs.len()
    }

    pub fn subscriptions(&self) -> &[RemoteSubscription] {
        &self.subs
    }

    pub fn has_sub(&self, msg_id: MsgId) -> bool {
        self.subs.iter().any(|s| s.msg_id == msg_id)
    }

    pub fn add_sub(&mut self, msg_id: MsgId, qos: Qos) -> Result<(), SubTableError> {
        if self.has_sub(msg_id) {
            return Err(SubTableError::Duplicate(msg_id));
        }
        if self.subs.len() >= self.max_subs {
            return Err(SubTableError::Full(self.max_subs));
        }
        self.subs.push(RemoteSubscription { msg_id, qos });
        Ok(())
    }

    /// Removes `msg_id`; returns whether it was present.
    pub fn remove_sub(&mut self, msg_id: MsgId) -> bool {
        match self.subs.iter().position(|s| s.msg_id == msg_id) {
            Some(idx) => {
                self.subs.swap_remove(idx);
                true
            }
            None => false,
        }
    }

    /// Empties the table, handing back what was in it.
    pub fn take_subs(&mut self) -> Vec<RemoteSubscription> {
        core::mem::take(&mut self.subs)
    }

    /// Back to the just-configured state: announcing, no timestamps.
    pub fn reset_link(&mut self) {
        self.state = PeerState::Announcing;
        self.last_sent = None;
        self.last_received = None;
    }
}

/// A local transport endpoint frames arrive on.
#[derive(Debug, Clone)]
pub struct HostRecord {
    pub identity: InterfaceIdentity,
    pub interface: InterfaceId,
    pub in_use: bool,
    /// Receive errors that could not be attributed to a peer.
    pub recv_err_count: u32,
}

impl HostRecord {
    pub fn new(identity: InterfaceIdentity, interface: InterfaceId) -> Self {
        Self { identity, interface, in_use: true, recv_err_count: 0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("peer table full ({0} peers)")]
pub struct RegistryFull(pub usize);

#[derive(Debug, Clone)]
pub struct PeerRegistry {
    peers: Vec<PeerRecord>,
    max_peers: usize,
}

impl PeerRegistry {
    pub fn new(max_peers: usize) -> Self {
        Self { peers: Vec::with_capacity(max_peers), max_peers }
    }

    /// Adds a peer, returning its index.
    pub fn add(&mut self, peer: PeerRecord) -> Result<usize, RegistryFull> {
        if self.peers.len() >= self.max_peers {
            return Err(RegistryFull(self.max_peers));
        }
        self.peers.push(peer);
        Ok(self.peers.len() - 1)
    }

    /// Index of the in-use peer with processor id `cpu_id`.
    pub fn find_by_cpu(&self, cpu_id: CpuId) -> Option<usize> {
        self.peers.iter().position(|p| p.in_use && p.cpu_id() == cpu_id)
    }

    pub fn get(&self, idx: usize) -> Option<&PeerRecord> {
        self.peers.get(idx)
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut PeerRecord> {
        self.peers.get_mut(idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerRecord> {
        self.peers.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PeerRecord> {
        self.peers.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_peers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(name: &str, cpu: CpuId) -> InterfaceIdentity {
        InterfaceIdentity {
            name: PeerName::from(name).unwrap(),
            processor_id: cpu,
            protocol_id: 1,
            spacecraft_id: 0x42,
            qos: 0,
        }
    }

    #[test]
    fn new_peer_is_announcing() {
        let peer = PeerRecord::new(identity("CPU2", 2), 0, 0, 4);
        assert_eq!(peer.state, PeerState::Announcing);
        assert!(peer.last_sent.is_none());
        assert_eq!(peer.sub_count(), 0);
    }

    #[test]
    fn subscription_table_is_bounded() {
        let mut peer = PeerRecord::new(identity("CPU2", 2), 0, 0, 2);
        peer.add_sub(0x0900, Qos::default()).unwrap();
        peer.add_sub(0x0901, Qos::default()).unwrap();
        assert_eq!(peer.add_sub(0x0902, Qos::default()), Err(SubTableError::Full(2)));
        assert_eq!(peer.add_sub(0x0900, Qos::default()), Err(SubTableError::Duplicate(0x0900)));
        assert!(peer.remove_sub(0x0900));
        assert!(!peer.remove_sub(0x0900));
        assert_eq!(peer.take_subs().len(), 1);
        assert_eq!(peer.sub_count(), 0);
    }

    #[test]
    fn registry_rejects_beyond_capacity() {
        let mut registry = PeerRegistry::new(1);
        assert_eq!(registry.add(PeerRecord::new(identity("CPU2", 2), 0, 0, 4)), Ok(0));
        assert_eq!(
            registry.add(PeerRecord::new(identity("CPU3", 3), 1, 1, 4)).unwrap_err(),
            RegistryFull(1)
        );
        assert_eq!(registry.find_by_cpu(2), Some(0));
        assert_eq!(registry.find_by_cpu(3), None);
    }

    #[test]
    fn lookup_skips_deactivated_peers() {
        let mut registry = PeerRegistry::new(2);
        registry.add(PeerRecord::new(identity("CPU2", 2), 0, 0, 4)).unwrap();
        registry.get_mut(0).unwrap().in_use = false;
        assert_eq!(registry.find_by_cpu(2), None);
    }
}
