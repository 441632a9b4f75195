//! Telemetry packets the engine publishes on the local bus.
//!
//! Payloads are JSON so ground tools can decode them without a schema
//! compiler.

use crate::msgids::{SBN_GET_PEER_LIST_RSP_MID, SBN_GET_PEER_STATUS_RSP_MID, SBN_HK_TLM_MID};
use crate::peer::{HostRecord, PeerCounters, PeerName, PeerRecord, PeerState};
use crate::transport::ModuleStatus;
use crate::wire::{CpuId, MsgId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A telemetry packet with a fixed message id and a JSON payload.
pub trait TelemetryPacket: Serialize + DeserializeOwned {
    const MSG_ID: MsgId;

    fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    fn from_payload(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

/// Command counters owned by the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandCounters {
    pub cmd_count: u16,
    pub cmd_err_count: u16,
}

impl CommandCounters {
    pub fn accepted(&mut self) {
        self.cmd_count = self.cmd_count.wrapping_add(1);
    }

    pub fn rejected(&mut self) {
        self.cmd_err_count = self.cmd_err_count.wrapping_add(1);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerHousekeeping {
    pub name: PeerName,
    pub processor_id: CpuId,
    pub protocol_id: u8,
    pub state: PeerState,
    pub in_use: bool,
    pub sub_count: usize,
    pub last_sent: Option<u64>,
    pub last_received: Option<u64>,
    pub counters: PeerCounters,
}

impl From<&PeerRecord> for PeerHousekeeping {
    fn from(peer: &PeerRecord) -> Self {
        Self {
            name: peer.identity.name,
            processor_id: peer.cpu_id(),
            protocol_id: peer.protocol_id(),
            state: peer.state,
            in_use: peer.in_use,
            sub_count: peer.sub_count(),
            last_sent: peer.last_sent,
            last_received: peer.last_received,
            counters: peer.counters,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostHousekeeping {
    pub name: PeerName,
    pub protocol_id: u8,
    pub in_use: bool,
    pub recv_err_count: u32,
}

impl From<&HostRecord> for HostHousekeeping {
    fn from(host: &HostRecord) -> Self {
        Self {
            name: host.identity.name,
            protocol_id: host.identity.protocol_id,
            in_use: host.in_use,
            recv_err_count: host.recv_err_count,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HousekeepingPacket {
    pub counters: CommandCounters,
    pub local_sub_count: usize,
    pub peers: Vec<PeerHousekeeping>,
    pub hosts: Vec<HostHousekeeping>,
}

impl TelemetryPacket for HousekeepingPacket {
    const MSG_ID: MsgId = SBN_HK_TLM_MID;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSummary {
    pub name: PeerName,
    pub processor_id: CpuId,
    pub protocol_id: u8,
    pub spacecraft_id: u32,
    pub state: PeerState,
    pub sub_count: usize,
}

impl From<&PeerRecord> for PeerSummary {
    fn from(peer: &PeerRecord) -> Self {
        Self {
            name: peer.identity.name,
            processor_id: peer.cpu_id(),
            protocol_id: peer.protocol_id(),
            spacecraft_id: peer.identity.spacecraft_id,
            state: peer.state,
            sub_count: peer.sub_count(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerListResponse {
    pub peer_count: usize,
    pub peers: Vec<PeerSummary>,
}

impl TelemetryPacket for PeerListResponse {
    const MSG_ID: MsgId = SBN_GET_PEER_LIST_RSP_MID;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerStatusResponse {
    pub peer_index: u8,
    pub name: PeerName,
    pub status: ModuleStatus,
}

impl TelemetryPacket for PeerStatusResponse {
    const MSG_ID: MsgId = SBN_GET_PEER_STATUS_RSP_MID;
}
