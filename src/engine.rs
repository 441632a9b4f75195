//! The SBN engine: peer protocol, subscription mirroring and message
//! forwarding between the local software bus and every configured peer.
//!
//! The engine is single threaded and does nothing on its own. The caller
//! waits for a wakeup (or a timeout) and then calls [`Engine::tick`] with the
//! current time in seconds. Each tick runs, in order: the protocol state
//! machine, the network receive poll, the local subscription pipe, the peer
//! output pipes and finally the command pipe.

use crate::bus::{BusError, BusMessage, PipeId, SenderId, SoftwareBus, SubscriptionReport, SUB_ENTRIES_PER_PKT};
use crate::commands::GroundCommand;
use crate::config::{ConfigError, EngineConfig};
use crate::events::EventId;
use crate::msgids::{SBN_CMD_MID, SBN_SEND_HK_MID, SBN_WAKEUP_MID, SB_ALLSUBS_TLM_MID, SB_ONESUB_TLM_MID};
use crate::peer::{HostRecord, InterfaceId, InterfaceIdentity, PeerName, PeerRecord, PeerRegistry, PeerState, SubTableError};
use crate::peer_file::{self, PeerFileEntry, PeerFileError};
use crate::subscriptions::{LocalSubTable, SubscribeOutcome, UnsubscribeOutcome};
use crate::telemetry::{
    CommandCounters, HostHousekeeping, HousekeepingPacket, PeerHousekeeping, PeerListResponse, PeerStatusResponse,
    PeerSummary, TelemetryPacket,
};
use crate::transport::{InterfaceRole, LocalIdentity, TransportRegistry};
use crate::wire::{pack_sub, unpack_sub, Frame, MsgId, MsgType, Qos};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Application name stamped on everything the engine publishes itself.
pub const APP_NAME: &str = "SBN";

const SUB_PIPE_NAME: &str = "SBN_SUB_PIPE";
const CMD_PIPE_NAME: &str = "SBN_CMD_PIPE";
const SCH_PIPE_NAME: &str = "SBN_SCH_PIPE";
const SUB_PIPE_DEPTH: usize = 256;
const CMD_PIPE_DEPTH: usize = 16;
const SCH_PIPE_DEPTH: usize = 4;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    PeerFile(#[from] PeerFileError),
    #[error("software bus: {0}")]
    Bus(#[from] BusError),
}

fn incr(counter: &mut u32) {
    *counter = counter.wrapping_add(1);
}

pub struct Engine<B: SoftwareBus> {
    config: EngineConfig,
    local: LocalIdentity,
    bus: B,
    transports: TransportRegistry,
    peers: PeerRegistry,
    hosts: Vec<HostRecord>,
    local_subs: LocalSubTable,
    sub_pipe: PipeId,
    cmd_pipe: PipeId,
    sch_pipe: PipeId,
    counters: CommandCounters,
    /// Time of the tick in progress, in seconds.
    now: u64,
}

impl<B: SoftwareBus> Engine<B> {
    /// Builds the engine from already parsed peer-file entries.
    ///
    /// Bad entries are logged and skipped. Failing to set up the engine's own
    /// pipes on the bus is fatal.
    pub fn new(
        config: EngineConfig,
        mut bus: B,
        transports: TransportRegistry,
        entries: Vec<PeerFileEntry>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let cpu_name = PeerName::from(&config.cpu_name).map_err(|_| ConfigError::CpuName(config.cpu_name.clone()))?;
        let local = LocalIdentity { cpu_id: config.cpu_id, cpu_name };

        let sub_pipe = bus.create_pipe(SUB_PIPE_NAME, SUB_PIPE_DEPTH)?;
        bus.subscribe_local(SB_ONESUB_TLM_MID, sub_pipe, SUB_PIPE_DEPTH)?;
        bus.subscribe_local(SB_ALLSUBS_TLM_MID, sub_pipe, SUB_PIPE_DEPTH)?;
        let cmd_pipe = bus.create_pipe(CMD_PIPE_NAME, CMD_PIPE_DEPTH)?;
        bus.subscribe_local(SBN_CMD_MID, cmd_pipe, CMD_PIPE_DEPTH)?;
        bus.subscribe_local(SBN_SEND_HK_MID, cmd_pipe, CMD_PIPE_DEPTH)?;
        let sch_pipe = bus.create_pipe(SCH_PIPE_NAME, SCH_PIPE_DEPTH)?;
        bus.subscribe_local(SBN_WAKEUP_MID, sch_pipe, SCH_PIPE_DEPTH)?;

        let mut engine = Self {
            peers: PeerRegistry::new(config.max_peers),
            hosts: Vec::new(),
            local_subs: LocalSubTable::new(config.max_subs_per_peer),
            config,
            local,
            bus,
            transports,
            sub_pipe,
            cmd_pipe,
            sch_pipe,
            counters: CommandCounters::default(),
            now: 0,
        };

        engine.load_interfaces(entries)?;
        engine.verify_interfaces();
        engine.send_subs_requests()?;

        info!(
            eid = %EventId::Init,
            cpu_id = engine.local.cpu_id,
            cpu_name = %engine.local.cpu_name,
            hosts = engine.hosts.iter().filter(|h| h.in_use).count(),
            peers = engine.peers.iter().filter(|p| p.in_use).count(),
            "SBN initialized"
        );
        Ok(engine)
    }

    /// Builds the engine from the configured peer file, trying the volatile
    /// path before the non-volatile one.
    pub fn from_peer_file(config: EngineConfig, bus: B, transports: TransportRegistry) -> Result<Self, EngineError> {
        let (path, parsed) = peer_file::load(&config.peer_file_candidates())?;
        info!(
            eid = %EventId::File,
            path = %path.display(),
            entries = parsed.entries.len(),
            rejected = parsed.rejected.len(),
            "peer file read"
        );
        Self::new(config, bus, transports, parsed.entries)
    }

    fn load_interfaces(&mut self, entries: Vec<PeerFileEntry>) -> Result<(), EngineError> {
        for entry in entries {
            let identity = entry.identity.clone();
            let Some(transport) = self.transports.get_mut(identity.protocol_id) else {
                error!(
                    eid = %EventId::File,
                    entry = entry.entry,
                    protocol_id = identity.protocol_id,
                    "no transport registered for protocol, entry skipped"
                );
                continue;
            };

            let iface = match transport.load_entry(&identity, &entry.protocol_fields()) {
                Ok(iface) => iface,
                Err(e) => {
                    error!(eid = %EventId::File, entry = entry.entry, name = %identity.name, "bad {} entry: {}", transport.name(), e);
                    continue;
                }
            };
            let role = match transport.init_interface(iface, &self.local) {
                Ok(role) => role,
                Err(e) => {
                    error!(eid = %EventId::Transport, name = %identity.name, "{} interface init failed: {}", transport.name(), e);
                    continue;
                }
            };

            match role {
                InterfaceRole::Host => {
                    debug!(eid = %EventId::Init, name = %identity.name, protocol_id = identity.protocol_id, "host interface");
                    self.hosts.push(HostRecord::new(identity, iface));
                }
                InterfaceRole::Peer => self.add_peer(identity, iface)?,
            }
        }
        Ok(())
    }

    fn add_peer(&mut self, identity: InterfaceIdentity, iface: InterfaceId) -> Result<(), EngineError> {
        if self.peers.len() >= self.peers.capacity() {
            error!(
                eid = %EventId::Peer,
                name = %identity.name,
                max_peers = self.peers.capacity(),
                "peer table full, entry skipped"
            );
            return Ok(());
        }
        let pipe_name = format!("SBN_PEER_{}_{}", identity.name, self.peers.len());
        let pipe = self.bus.create_pipe(&pipe_name, self.config.peer_pipe_depth)?;
        debug!(eid = %EventId::Init, name = %identity.name, cpu_id = identity.processor_id, "peer interface");
        let record = PeerRecord::new(identity, iface, pipe, self.config.max_subs_per_peer);
        if let Err(e) = self.peers.add(record) {
            error!(eid = %EventId::Peer, "{e}");
            self.bus.delete_pipe(pipe)?;
        }
        Ok(())
    }

    fn host_interfaces(&self, protocol_id: u8) -> Vec<InterfaceId> {
        self.hosts
            .iter()
            .filter(|h| h.in_use && h.identity.protocol_id == protocol_id)
            .map(|h| h.interface)
            .collect()
    }

    fn peer_interfaces(&self, protocol_id: u8) -> Vec<InterfaceId> {
        self.peers
            .iter()
            .filter(|p| p.in_use && p.protocol_id() == protocol_id)
            .map(|p| p.interface)
            .collect()
    }

    /// Deactivates peers without a usable host and hosts without a peer.
    fn verify_interfaces(&mut self) {
        for idx in 0..self.peers.len() {
            let Some(peer) = self.peers.get(idx) else { continue };
            let (protocol_id, iface) = (peer.protocol_id(), peer.interface);
            let hosts = self.host_interfaces(protocol_id);
            let valid = self
                .transports
                .get_mut(protocol_id)
                .is_some_and(|t| t.verify_peer(iface, &hosts));
            if !valid {
                if let Some(peer) = self.peers.get_mut(idx) {
                    peer.in_use = false;
                    error!(eid = %EventId::Peer, peer = %peer.name(), cpu_id = peer.cpu_id(), "invalid peer interface, deactivated");
                }
            }
        }

        for idx in 0..self.hosts.len() {
            let (protocol_id, iface) = (self.hosts[idx].identity.protocol_id, self.hosts[idx].interface);
            let peers = self.peer_interfaces(protocol_id);
            let valid = self
                .transports
                .get_mut(protocol_id)
                .is_some_and(|t| t.verify_host(iface, &peers));
            if !valid {
                self.hosts[idx].in_use = false;
                error!(eid = %EventId::Peer, host = %self.hosts[idx].identity.name, "invalid host interface, deactivated");
            }
        }
    }

    /// Turns on bus subscription reporting and asks for everything already
    /// subscribed, so the local table starts complete.
    fn send_subs_requests(&mut self) -> Result<(), EngineError> {
        self.bus.enable_subscription_reporting()?;
        self.bus.request_previous_subscriptions()?;
        Ok(())
    }

    /// Blocks until a wakeup arrives or `timeout` passes. Either way the
    /// caller runs a tick next; the return value only says which it was.
    pub fn wait_for_wakeup(&mut self, timeout: Duration) -> Result<bool, EngineError> {
        Ok(self.bus.receive_timeout(self.sch_pipe, timeout)?.is_some())
    }

    /// One pass of the main loop at time `now` (seconds).
    pub fn tick(&mut self, now: u64) {
        self.now = now;
        self.run_protocol();
        self.check_for_net_msgs();
        self.check_subscription_pipe();
        self.check_peer_pipes();
        self.check_cmd_pipe();
    }

    pub fn shutdown(&mut self) {
        info!(eid = %EventId::Init, "SBN shutting down");
        self.transports.shutdown();
    }

    // ---- protocol state machine ----

    fn run_protocol(&mut self) {
        let now = self.now;
        for idx in 0..self.peers.len() {
            let Some(peer) = self.peers.get(idx) else { continue };
            if !peer.in_use {
                continue;
            }
            let since_sent = peer.last_sent.map(|t| now.saturating_sub(t));
            let since_received = peer.last_received.map(|t| now.saturating_sub(t));
            let state = peer.state;

            match state {
                PeerState::Announcing => {
                    if since_sent.is_none_or(|s| s >= self.config.announce_timeout) {
                        self.send_bare(idx, MsgType::Announce);
                    }
                }
                PeerState::Heartbeating => {
                    if since_received.is_none_or(|s| s > self.config.heartbeat_timeout) {
                        self.lose_peer(idx);
                        continue;
                    }
                    if since_sent.is_none_or(|s| s > self.config.heartbeat_sendtime) {
                        self.send_bare(idx, MsgType::Heartbeat);
                    }
                }
            }
        }
    }

    fn lose_peer(&mut self, idx: usize) {
        self.purge_peer_subs(idx);
        self.drain_peer_pipe(idx);
        if let Some(peer) = self.peers.get_mut(idx) {
            peer.state = PeerState::Announcing;
            info!(eid = %EventId::Peer, peer = %peer.name(), cpu_id = peer.cpu_id(), "peer lost connection");
        }
    }

    /// Unsubscribes the peer's pipe from everything it asked for.
    fn purge_peer_subs(&mut self, idx: usize) {
        let Some(peer) = self.peers.get_mut(idx) else { return };
        let pipe = peer.pipe;
        let subs = peer.take_subs();
        let count = subs.len();
        for sub in subs {
            if let Err(e) = self.bus.unsubscribe_local(sub.msg_id, pipe) {
                warn!(eid = %EventId::Sb, peer = %peer.name(), msg_id = sub.msg_id, "unsubscribe failed: {e}");
            }
        }
        debug!(eid = %EventId::Sub, peer = %peer.name(), count, "remote subscriptions purged");
    }

    /// Discards whatever is still queued for a peer that went away.
    fn drain_peer_pipe(&mut self, idx: usize) {
        let Some(peer) = self.peers.get(idx) else { return };
        let pipe = peer.pipe;
        let mut dropped = 0usize;
        while self.bus.receive(pipe).is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!(eid = %EventId::Msg, peer = %peer.name(), dropped, "stale messages discarded");
        }
    }

    // ---- sending ----

    /// Sends one frame to a peer, stamping `last_sent` on success.
    fn send_to_peer(&mut self, idx: usize, frame: &Frame) -> bool {
        let now = self.now;
        let Some(peer) = self.peers.get_mut(idx) else { return false };
        let Some(transport) = self.transports.get_mut(peer.protocol_id()) else {
            incr(&mut peer.counters.app_msg_send_err);
            return false;
        };
        match transport.send(peer.interface, frame) {
            Ok(_) => {
                peer.last_sent = Some(now);
                true
            }
            Err(e) => {
                incr(&mut peer.counters.app_msg_send_err);
                warn!(
                    eid = %EventId::Transport,
                    peer = %peer.name(),
                    msg_type = %frame.msg_type,
                    "send failed: {}",
                    e
                );
                false
            }
        }
    }

    fn send_bare(&mut self, idx: usize, msg_type: MsgType) -> bool {
        let frame = Frame::bare(msg_type, self.local.cpu_id);
        self.send_to_peer(idx, &frame)
    }

    fn send_sub_frame(&mut self, idx: usize, msg_type: MsgType, msg_id: MsgId, qos: Qos) -> bool {
        let frame = Frame::new(msg_type, self.local.cpu_id, pack_sub(msg_id, qos).to_vec());
        self.send_to_peer(idx, &frame)
    }

    fn heartbeating_peers(&self) -> Vec<usize> {
        (0..self.peers.len())
            .filter(|idx| self.peers.get(*idx).is_some_and(|p| p.in_use && p.is_heartbeating()))
            .collect()
    }

    /// Replays every local subscription to one peer.
    fn send_local_subs_to_peer(&mut self, idx: usize) {
        let subs: Vec<(MsgId, Qos)> = self.local_subs.iter().map(|s| (s.msg_id, s.qos)).collect();
        for (msg_id, qos) in &subs {
            self.send_sub_frame(idx, MsgType::Subscribe, *msg_id, *qos);
        }
        if let Some(peer) = self.peers.get(idx) {
            info!(eid = %EventId::Sub, peer = %peer.name(), count = subs.len(), "local subscriptions sent");
        }
    }

    // ---- network receive ----

    fn check_for_net_msgs(&mut self) {
        for h in 0..self.hosts.len() {
            if !self.hosts[h].in_use {
                continue;
            }
            let (protocol_id, iface) = (self.hosts[h].identity.protocol_id, self.hosts[h].interface);
            for _ in 0..self.config.max_msgs_per_host_poll {
                let Some(transport) = self.transports.get_mut(protocol_id) else { break };
                match transport.receive(iface) {
                    Ok(frame) => self.process_net_msg(frame),
                    Err(nb::Error::WouldBlock) => break,
                    Err(nb::Error::Other(e)) => {
                        incr(&mut self.hosts[h].recv_err_count);
                        warn!(eid = %EventId::Transport, host = %self.hosts[h].identity.name, "receive failed: {e}");
                        break;
                    }
                }
            }
        }
    }

    fn process_net_msg(&mut self, frame: Frame) {
        let Some(idx) = self.peers.find_by_cpu(frame.cpu_id) else {
            warn!(eid = %EventId::Proto, cpu_id = frame.cpu_id, msg_type = %frame.msg_type, "message from unknown CPU dropped");
            return;
        };

        let now = self.now;
        let Some(peer) = self.peers.get_mut(idx) else { return };
        let was_announcing = peer.state == PeerState::Announcing;
        peer.last_received = Some(now);
        peer.state = PeerState::Heartbeating;
        if was_announcing {
            info!(eid = %EventId::Peer, peer = %peer.name(), cpu_id = peer.cpu_id(), "peer connected");
        }
        if was_announcing || frame.msg_type == MsgType::Announce {
            self.send_local_subs_to_peer(idx);
        }

        match frame.msg_type {
            MsgType::Announce => {
                self.send_bare(idx, MsgType::AnnounceAck);
            }
            MsgType::Heartbeat => {
                self.send_bare(idx, MsgType::HeartbeatAck);
            }
            MsgType::Subscribe => self.process_sub_from_peer(idx, &frame.payload),
            MsgType::Unsubscribe => self.process_unsub_from_peer(idx, &frame.payload),
            MsgType::AppMsg => self.process_app_msg(idx, &frame),
            MsgType::AnnounceAck | MsgType::HeartbeatAck | MsgType::CommandAck | MsgType::CommandNack => {
                debug!(eid = %EventId::Proto, cpu_id = frame.cpu_id, msg_type = %frame.msg_type, "received");
            }
        }
    }

    fn process_app_msg(&mut self, idx: usize, frame: &Frame) {
        let sender = SenderId::Network { cpu_id: frame.cpu_id };
        let result = BusMessage::from_network_bytes(&frame.payload, sender).and_then(|msg| self.bus.send(msg));
        let Some(peer) = self.peers.get_mut(idx) else { return };
        match result {
            Ok(()) => incr(&mut peer.counters.app_msg_recv),
            Err(e) => {
                incr(&mut peer.counters.app_msg_recv_err);
                warn!(eid = %EventId::Msg, peer = %peer.name(), "app message not published: {e}");
            }
        }
    }

    fn process_sub_from_peer(&mut self, idx: usize, payload: &[u8]) {
        let Some(peer) = self.peers.get_mut(idx) else { return };
        let (msg_id, qos) = match unpack_sub(payload) {
            Ok(sub) => sub,
            Err(e) => {
                incr(&mut peer.counters.app_msg_recv_err);
                warn!(eid = %EventId::Sub, peer = %peer.name(), "bad subscription payload: {e}");
                return;
            }
        };
        match peer.add_sub(msg_id, qos) {
            Ok(()) => {
                if let Err(e) = self.bus.subscribe_local(msg_id, peer.pipe, self.config.msg_limit) {
                    peer.remove_sub(msg_id);
                    error!(eid = %EventId::Sb, peer = %peer.name(), msg_id, "subscribe failed: {e}");
                    return;
                }
                debug!(eid = %EventId::Sub, peer = %peer.name(), msg_id, "peer subscribed");
            }
            Err(SubTableError::Duplicate(_)) => {
                debug!(eid = %EventId::Sub, peer = %peer.name(), msg_id, "peer already subscribed");
            }
            Err(e @ SubTableError::Full(_)) => {
                error!(eid = %EventId::Sub, peer = %peer.name(), msg_id, "cannot add subscription: {e}");
            }
        }
    }

    fn process_unsub_from_peer(&mut self, idx: usize, payload: &[u8]) {
        let Some(peer) = self.peers.get_mut(idx) else { return };
        let msg_id = match unpack_sub(payload) {
            Ok((msg_id, _)) => msg_id,
            Err(e) => {
                incr(&mut peer.counters.app_msg_recv_err);
                warn!(eid = %EventId::Sub, peer = %peer.name(), "bad unsubscription payload: {e}");
                return;
            }
        };
        if !peer.remove_sub(msg_id) {
            info!(eid = %EventId::Sub, peer = %peer.name(), msg_id, "unsubscribe for unknown message id");
            return;
        }
        if let Err(e) = self.bus.unsubscribe_local(msg_id, peer.pipe) {
            warn!(eid = %EventId::Sb, peer = %peer.name(), msg_id, "unsubscribe failed: {e}");
        }
    }

    // ---- local subscriptions ----

    fn check_subscription_pipe(&mut self) {
        loop {
            match self.bus.receive(self.sub_pipe) {
                Ok(msg) => self.process_sub_report(&msg),
                Err(nb::Error::WouldBlock) => break,
                Err(nb::Error::Other(e)) => {
                    error!(eid = %EventId::Sb, "subscription pipe read failed: {e}");
                    break;
                }
            }
        }
    }

    fn process_sub_report(&mut self, msg: &BusMessage) {
        let report = match SubscriptionReport::decode(msg.msg_id, &msg.payload) {
            Ok(report) => report,
            Err(e) => {
                error!(eid = %EventId::Sub, msg_id = msg.msg_id, "bad subscription report: {e}");
                return;
            }
        };
        match report {
            SubscriptionReport::Subscribed { msg_id, qos } => self.process_local_sub(msg_id, qos),
            SubscriptionReport::Unsubscribed { msg_id } => self.process_local_unsub(msg_id),
            SubscriptionReport::All(entries) => {
                if entries.len() > SUB_ENTRIES_PER_PKT {
                    error!(
                        eid = %EventId::Sub,
                        count = entries.len(),
                        max = SUB_ENTRIES_PER_PKT,
                        "too many entries in subscription batch"
                    );
                    return;
                }
                for (msg_id, qos) in entries {
                    self.process_local_sub(msg_id, qos);
                }
            }
        }
    }

    fn process_local_sub(&mut self, msg_id: MsgId, qos: Qos) {
        match self.local_subs.subscribe(msg_id, qos) {
            SubscribeOutcome::Added => {
                for idx in self.heartbeating_peers() {
                    self.send_sub_frame(idx, MsgType::Subscribe, msg_id, qos);
                }
            }
            SubscribeOutcome::Incremented(count) => {
                debug!(eid = %EventId::Sub, msg_id, count, "local subscription count raised");
            }
            SubscribeOutcome::Ignored => {}
            SubscribeOutcome::TableFull => {
                error!(
                    eid = %EventId::Sub,
                    msg_id,
                    max = self.config.max_subs_per_peer,
                    "local subscription table full"
                );
            }
        }
    }

    fn process_local_unsub(&mut self, msg_id: MsgId) {
        match self.local_subs.unsubscribe(msg_id) {
            UnsubscribeOutcome::Removed(sub) => {
                for idx in self.heartbeating_peers() {
                    self.send_sub_frame(idx, MsgType::Unsubscribe, sub.msg_id, sub.qos);
                }
            }
            UnsubscribeOutcome::Decremented(count) => {
                debug!(eid = %EventId::Sub, msg_id, count, "local subscription count lowered");
            }
            UnsubscribeOutcome::NotFound => {
                info!(eid = %EventId::Sub, msg_id, "unsubscribe for message id not subscribed locally");
            }
        }
    }

    // ---- forwarding ----

    /// Round-robin over heartbeating peers, one message each per round.
    fn check_peer_pipes(&mut self) {
        for _ in 0..self.config.max_msg_per_wakeup {
            let mut any = false;
            for idx in self.heartbeating_peers() {
                let Some(pipe) = self.peers.get(idx).map(|p| p.pipe) else { continue };
                let msg = match self.bus.receive(pipe) {
                    Ok(msg) => msg,
                    Err(nb::Error::WouldBlock) => continue,
                    Err(nb::Error::Other(e)) => {
                        error!(eid = %EventId::Sb, pipe, "peer pipe read failed: {e}");
                        continue;
                    }
                };
                any = true;
                if msg.sender.is_network() {
                    continue;
                }
                let frame = Frame::new(MsgType::AppMsg, self.local.cpu_id, msg.to_network_bytes());
                if self.send_to_peer(idx, &frame) {
                    if let Some(peer) = self.peers.get_mut(idx) {
                        incr(&mut peer.counters.app_msg_sent);
                    }
                }
            }
            if !any {
                break;
            }
        }
    }

    // ---- commands and housekeeping ----

    fn check_cmd_pipe(&mut self) {
        loop {
            match self.bus.receive(self.cmd_pipe) {
                Ok(msg) => match msg.msg_id {
                    SBN_CMD_MID => self.process_command(&msg),
                    SBN_SEND_HK_MID => {
                        let hk = self.housekeeping();
                        self.publish(&hk);
                    }
                    other => {
                        error!(eid = %EventId::Cmd, msg_id = other, "unexpected message id on command pipe");
                    }
                },
                Err(nb::Error::WouldBlock) => break,
                Err(nb::Error::Other(e)) => {
                    error!(eid = %EventId::Sb, "command pipe read failed: {e}");
                    break;
                }
            }
        }
    }

    fn process_command(&mut self, msg: &BusMessage) {
        let cmd = match GroundCommand::decode(&msg.payload) {
            Ok(cmd) => cmd,
            Err(e) => {
                self.counters.rejected();
                error!(eid = %EventId::Cmd, "{e}");
                return;
            }
        };
        match cmd {
            GroundCommand::Noop => {
                self.counters.accepted();
                info!(eid = %EventId::Cmd, "no-op command");
            }
            GroundCommand::ResetCounters => {
                self.reset_counters();
                info!(eid = %EventId::Cmd, "counters reset");
            }
            GroundCommand::GetPeerList => {
                self.counters.accepted();
                let list = self.peer_list();
                self.publish(&list);
            }
            GroundCommand::GetPeerStatus { peer } => self.get_peer_status(peer),
            GroundCommand::ResetPeer { peer } => self.reset_peer(peer),
        }
    }

    fn peer_for_command(&mut self, peer: u8) -> Option<usize> {
        let idx = usize::from(peer);
        if idx >= self.peers.len() {
            self.counters.rejected();
            error!(eid = %EventId::Cmd, peer = idx, peer_count = self.peers.len(), "invalid peer index");
            return None;
        }
        Some(idx)
    }

    fn get_peer_status(&mut self, peer: u8) {
        let Some(idx) = self.peer_for_command(peer) else { return };
        let Some(record) = self.peers.get(idx) else { return };
        let (protocol_id, iface, name) = (record.protocol_id(), record.interface, record.identity.name);
        let hosts = self.host_interfaces(protocol_id);
        let Some(transport) = self.transports.get_mut(protocol_id) else {
            self.counters.rejected();
            return;
        };
        match transport.report_status(iface, &hosts) {
            Ok(status) => {
                self.counters.accepted();
                self.publish(&PeerStatusResponse { peer_index: peer, name, status });
            }
            Err(e) if e.is_not_implemented() => {
                self.counters.accepted();
                info!(eid = %EventId::Cmd, peer = %name, "{} status not implemented", transport.name());
            }
            Err(e) => {
                self.counters.rejected();
                error!(eid = %EventId::Cmd, peer = %name, "peer status failed: {e}");
            }
        }
    }

    /// Resets the link layer and drops the peer back to announcing.
    fn reset_peer(&mut self, peer: u8) {
        let Some(idx) = self.peer_for_command(peer) else { return };
        let Some(record) = self.peers.get(idx) else { return };
        let (protocol_id, iface, name) = (record.protocol_id(), record.interface, record.identity.name);
        let hosts = self.host_interfaces(protocol_id);
        let result = match self.transports.get_mut(protocol_id) {
            Some(transport) => transport.reset_peer(iface, &hosts),
            None => Ok(()),
        };
        match result {
            Ok(()) => self.counters.accepted(),
            Err(e) if e.is_not_implemented() => {
                self.counters.accepted();
                info!(eid = %EventId::Cmd, peer = %name, "transport reset not implemented");
            }
            Err(e) => {
                self.counters.rejected();
                error!(eid = %EventId::Cmd, peer = %name, "transport reset failed: {e}");
            }
        }

        self.purge_peer_subs(idx);
        self.drain_peer_pipe(idx);
        if let Some(record) = self.peers.get_mut(idx) {
            record.reset_link();
        }
        info!(eid = %EventId::Cmd, peer = %name, "peer reset");
    }

    fn reset_counters(&mut self) {
        self.counters = CommandCounters::default();
        for peer in self.peers.iter_mut() {
            peer.counters = Default::default();
        }
        for host in &mut self.hosts {
            host.recv_err_count = 0;
        }
    }

    fn publish<T: TelemetryPacket>(&mut self, packet: &T) {
        let payload = match packet.to_payload() {
            Ok(payload) => payload,
            Err(e) => {
                error!(eid = %EventId::Hk, msg_id = T::MSG_ID, "telemetry encode failed: {e}");
                return;
            }
        };
        let msg = BusMessage::new(T::MSG_ID, payload, SenderId::App(APP_NAME.to_string()));
        if let Err(e) = self.bus.send(msg) {
            error!(eid = %EventId::Sb, msg_id = T::MSG_ID, "telemetry publish failed: {e}");
        }
    }

    // ---- inspection ----

    pub fn housekeeping(&self) -> HousekeepingPacket {
        HousekeepingPacket {
            counters: self.counters,
            local_sub_count: self.local_subs.len(),
            peers: self.peers.iter().map(PeerHousekeeping::from).collect(),
            hosts: self.hosts.iter().map(HostHousekeeping::from).collect(),
        }
    }

    pub fn peer_list(&self) -> PeerListResponse {
        PeerListResponse {
            peer_count: self.peers.len(),
            peers: self.peers.iter().map(PeerSummary::from).collect(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn local(&self) -> &LocalIdentity {
        &self.local
    }

    pub fn peers(&self) -> &PeerRegistry {
        &self.peers
    }

    pub fn hosts(&self) -> &[HostRecord] {
        &self.hosts
    }

    pub fn local_subs(&self) -> &LocalSubTable {
        &self.local_subs
    }

    pub fn counters(&self) -> CommandCounters {
        self.counters
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    pub fn transports_mut(&mut self) -> &mut TransportRegistry {
        &mut self.transports
    }
}

impl<B: SoftwareBus> core::fmt::Debug for Engine<B> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Engine")
            .field("local", &self.local)
            .field("peers", &self.peers.len())
            .field("hosts", &self.hosts.len())
            .field("local_subs", &self.local_subs.len())
            .field("transports", &self.transports)
            .finish()
    }
}
