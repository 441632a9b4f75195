//! The local software bus the engine bridges onto the network.
//!
//! The engine only ever talks to the bus through [`SoftwareBus`]. A flight
//! build plugs the host executive's bus in here; [`LocalBus`] is a complete
//! in-process implementation used by the `sbn` binary and by the tests.

use crate::msgids::{SB_ALLSUBS_TLM_MID, SB_ONESUB_TLM_MID};
use crate::wire::{CpuId, MsgId, Qos};
use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;

pub type PipeId = usize;

/// Maximum entries carried by one all-subscriptions report.
pub const SUB_ENTRIES_PER_PKT: usize = 20;

/// Who put a message on the bus.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SenderId {
    /// A local application, by name.
    App(String),
    /// The engine, republishing traffic received from the given peer CPU.
    Network { cpu_id: CpuId },
}

impl SenderId {
    pub fn is_network(&self) -> bool {
        matches!(self, SenderId::Network { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub msg_id: MsgId,
    pub payload: Vec<u8>,
    pub sender: SenderId,
}

impl BusMessage {
    pub fn new(msg_id: MsgId, payload: Vec<u8>, sender: SenderId) -> Self {
        Self { msg_id, payload, sender }
    }

    /// Total length as seen by command validation: id plus payload.
    pub fn total_len(&self) -> usize {
        2 + self.payload.len()
    }

    /// Encodes the message for an APP_MSG frame: `msg_id (u16) | payload`.
    /// The sender stays local.
    pub fn to_network_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_len());
        out.put_u16(self.msg_id);
        out.put_slice(&self.payload);
        out
    }

    pub fn from_network_bytes(mut bytes: &[u8], sender: SenderId) -> Result<Self, BusError> {
        if bytes.len() < 2 {
            return Err(BusError::Malformed("app message shorter than its message id"));
        }
        let msg_id = bytes.get_u16();
        Ok(Self::new(msg_id, bytes.to_vec(), sender))
    }
}

/// Subscription change notifications published by the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionReport {
    Subscribed { msg_id: MsgId, qos: Qos },
    Unsubscribed { msg_id: MsgId },
    /// Batch answer to a previous-subscriptions request.
    All(Vec<(MsgId, Qos)>),
}

const REPORT_SUBSCRIBE: u8 = 1;
const REPORT_UNSUBSCRIBE: u8 = 2;

impl SubscriptionReport {
    pub fn msg_id(&self) -> MsgId {
        match self {
            SubscriptionReport::All(_) => SB_ALLSUBS_TLM_MID,
            _ => SB_ONESUB_TLM_MID,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            SubscriptionReport::Subscribed { msg_id, qos } => {
                out.put_u8(REPORT_SUBSCRIBE);
                out.put_u16(*msg_id);
                out.put_u8(qos.priority);
                out.put_u8(qos.reliability);
            }
            SubscriptionReport::Unsubscribed { msg_id } => {
                out.put_u8(REPORT_UNSUBSCRIBE);
                out.put_u16(*msg_id);
                out.put_u8(0);
                out.put_u8(0);
            }
            SubscriptionReport::All(entries) => {
                out.put_u16(entries.len() as u16);
                for (msg_id, qos) in entries {
                    out.put_u16(*msg_id);
                    out.put_u8(qos.priority);
                    out.put_u8(qos.reliability);
                }
            }
        }
        out
    }

    /// Decodes a report carried on `msg_id`. `All` batches are decoded with
    /// their declared count, which may exceed [`SUB_ENTRIES_PER_PKT`]; the
    /// caller decides whether to honour it.
    pub fn decode(msg_id: MsgId, mut bytes: &[u8]) -> Result<Self, BusError> {
        match msg_id {
            SB_ONESUB_TLM_MID => {
                if bytes.len() < 5 {
                    return Err(BusError::Malformed("subscription report too short"));
                }
                let sub_type = bytes.get_u8();
                let msg_id = bytes.get_u16();
                let qos = Qos::new(bytes.get_u8(), bytes.get_u8());
                match sub_type {
                    REPORT_SUBSCRIBE => Ok(SubscriptionReport::Subscribed { msg_id, qos }),
                    REPORT_UNSUBSCRIBE => Ok(SubscriptionReport::Unsubscribed { msg_id }),
                    other => Err(BusError::UnexpectedSubType(other)),
                }
            }
            SB_ALLSUBS_TLM_MID => {
                if bytes.len() < 2 {
                    return Err(BusError::Malformed("all-subscriptions report too short"));
                }
                let count = usize::from(bytes.get_u16());
                let mut entries = Vec::with_capacity(count.min(SUB_ENTRIES_PER_PKT));
                while bytes.len() >= 4 && entries.len() < count {
                    let msg_id = bytes.get_u16();
                    let qos = Qos::new(bytes.get_u8(), bytes.get_u8());
                    entries.push((msg_id, qos));
                }
                if entries.len() != count {
                    return Err(BusError::Malformed("all-subscriptions entry count mismatch"));
                }
                Ok(SubscriptionReport::All(entries))
            }
            other => Err(BusError::UnexpectedMsgId(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("invalid pipe {0}")]
    InvalidPipe(PipeId),
    #[error("pipe name {0:?} already in use")]
    DuplicatePipeName(String),
    #[error("pipe {0} is full")]
    PipeFull(PipeId),
    #[error("message 0x{0:04X} not subscribed on that pipe")]
    NotSubscribed(MsgId),
    #[error("unexpected message id 0x{0:04X}")]
    UnexpectedMsgId(MsgId),
    #[error("unexpected subscription report type {0}")]
    UnexpectedSubType(u8),
    #[error("malformed bus message: {0}")]
    Malformed(&'static str),
    #[error("bus state poisoned")]
    Poisoned,
}

/// Operations the engine needs from the host software bus.
pub trait SoftwareBus {
    fn create_pipe(&mut self, name: &str, depth: usize) -> Result<PipeId, BusError>;

    fn delete_pipe(&mut self, pipe: PipeId) -> Result<(), BusError>;

    /// Subscribe and emit a subscription report when reporting is enabled.
    fn subscribe(&mut self, msg_id: MsgId, pipe: PipeId) -> Result<(), BusError>;

    /// Subscribe without emitting a subscription report. `msg_limit` bounds
    /// how many messages of this id may wait in the pipe.
    fn subscribe_local(&mut self, msg_id: MsgId, pipe: PipeId, msg_limit: usize) -> Result<(), BusError>;

    fn unsubscribe(&mut self, msg_id: MsgId, pipe: PipeId) -> Result<(), BusError>;

    fn unsubscribe_local(&mut self, msg_id: MsgId, pipe: PipeId) -> Result<(), BusError>;

    fn send(&mut self, msg: BusMessage) -> Result<(), BusError>;

    /// Non-blocking receive; `WouldBlock` when the pipe is empty.
    fn receive(&mut self, pipe: PipeId) -> nb::Result<BusMessage, BusError>;

    /// Blocks for at most `timeout`; `Ok(None)` on timeout.
    fn receive_timeout(&mut self, pipe: PipeId, timeout: Duration) -> Result<Option<BusMessage>, BusError>;

    fn enable_subscription_reporting(&mut self) -> Result<(), BusError>;

    /// Ask the bus to publish every existing subscription as batch reports.
    fn request_previous_subscriptions(&mut self) -> Result<(), BusError>;
}

#[derive(Debug)]
struct Pipe {
    name: String,
    depth: usize,
    queue: VecDeque<BusMessage>,
}

#[derive(Debug, Clone, Copy)]
struct Route {
    pipe: PipeId,
    msg_limit: usize,
    reported: bool,
}

#[derive(Debug, Default)]
struct BusState {
    pipes: HashMap<PipeId, Pipe>,
    routes: HashMap<MsgId, Vec<Route>>,
    next_pipe: PipeId,
    reporting: bool,
    dropped: u64,
}

impl BusState {
    fn pipe_mut(&mut self, pipe: PipeId) -> Result<&mut Pipe, BusError> {
        self.pipes.get_mut(&pipe).ok_or(BusError::InvalidPipe(pipe))
    }

    /// Returns false when the pipe already had a route for `msg_id`; only its
    /// limit is updated then.
    fn add_route(&mut self, msg_id: MsgId, route: Route) -> Result<bool, BusError> {
        self.pipe_mut(route.pipe)?;
        let routes = self.routes.entry(msg_id).or_default();
        if let Some(existing) = routes.iter_mut().find(|r| r.pipe == route.pipe) {
            existing.msg_limit = route.msg_limit;
            return Ok(false);
        }
        routes.push(route);
        Ok(true)
    }

    fn remove_route(&mut self, msg_id: MsgId, pipe: PipeId) -> Result<Route, BusError> {
        let routes = self.routes.get_mut(&msg_id).ok_or(BusError::NotSubscribed(msg_id))?;
        let idx = routes
            .iter()
            .position(|r| r.pipe == pipe)
            .ok_or(BusError::NotSubscribed(msg_id))?;
        let route = routes.remove(idx);
        if routes.is_empty() {
            self.routes.remove(&msg_id);
        }
        Ok(route)
    }

    fn deliver(&mut self, msg: &BusMessage) -> bool {
        let Some(routes) = self.routes.get(&msg.msg_id) else {
            return false;
        };
        let routes = routes.clone();
        let mut delivered = false;
        for route in routes {
            let Some(pipe) = self.pipes.get_mut(&route.pipe) else {
                continue;
            };
            let queued = pipe.queue.iter().filter(|m| m.msg_id == msg.msg_id).count();
            if pipe.queue.len() >= pipe.depth || queued >= route.msg_limit {
                self.dropped += 1;
                continue;
            }
            pipe.queue.push_back(msg.clone());
            delivered = true;
        }
        delivered
    }

    fn report(&mut self, report: &SubscriptionReport) {
        if !self.reporting {
            return;
        }
        let msg = BusMessage::new(report.msg_id(), report.encode(), SenderId::App(BUS_APP_NAME.into()));
        self.deliver(&msg);
    }
}

const BUS_APP_NAME: &str = "SB";
const DEFAULT_MSG_LIMIT: usize = 4;

/// Thread-safe in-process software bus. Clones share the same bus.
#[derive(Debug, Clone, Default)]
pub struct LocalBus {
    shared: Arc<(Mutex<BusState>, Condvar)>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, BusState>, BusError> {
        self.shared.0.lock().map_err(|_| BusError::Poisoned)
    }

    /// Number of messages dropped because a pipe or a per-id limit was full.
    pub fn dropped(&self) -> u64 {
        self.state().map_or(0, |s| s.dropped)
    }

    /// Number of messages waiting on `pipe`.
    pub fn pending(&self, pipe: PipeId) -> usize {
        self.state()
            .ok()
            .and_then(|s| s.pipes.get(&pipe).map(|p| p.queue.len()))
            .unwrap_or(0)
    }

    pub fn pipe_by_name(&self, name: &str) -> Option<PipeId> {
        let state = self.state().ok()?;
        state.pipes.iter().find(|(_, p)| p.name == name).map(|(id, _)| *id)
    }

    /// Pipes currently subscribed to `msg_id`.
    pub fn subscribers(&self, msg_id: MsgId) -> Vec<PipeId> {
        self.state()
            .ok()
            .and_then(|s| s.routes.get(&msg_id).map(|r| r.iter().map(|r| r.pipe).collect()))
            .unwrap_or_default()
    }
}

impl SoftwareBus for LocalBus {
    fn create_pipe(&mut self, name: &str, depth: usize) -> Result<PipeId, BusError> {
        let mut state = self.state()?;
        if state.pipes.values().any(|p| p.name == name) {
            return Err(BusError::DuplicatePipeName(name.to_string()));
        }
        let id = state.next_pipe;
        state.next_pipe += 1;
        state.pipes.insert(id, Pipe { name: name.to_string(), depth, queue: VecDeque::new() });
        Ok(id)
    }

    fn delete_pipe(&mut self, pipe: PipeId) -> Result<(), BusError> {
        let mut state = self.state()?;
        state.pipes.remove(&pipe).ok_or(BusError::InvalidPipe(pipe))?;
        for routes in state.routes.values_mut() {
            routes.retain(|r| r.pipe != pipe);
        }
        state.routes.retain(|_, routes| !routes.is_empty());
        Ok(())
    }

    fn subscribe(&mut self, msg_id: MsgId, pipe: PipeId) -> Result<(), BusError> {
        let mut state = self.state()?;
        if state.add_route(msg_id, Route { pipe, msg_limit: DEFAULT_MSG_LIMIT, reported: true })? {
            state.report(&SubscriptionReport::Subscribed { msg_id, qos: Qos::default() });
        }
        Ok(())
    }

    fn subscribe_local(&mut self, msg_id: MsgId, pipe: PipeId, msg_limit: usize) -> Result<(), BusError> {
        let mut state = self.state()?;
        state.add_route(msg_id, Route { pipe, msg_limit, reported: false }).map(|_| ())
    }

    fn unsubscribe(&mut self, msg_id: MsgId, pipe: PipeId) -> Result<(), BusError> {
        let mut state = self.state()?;
        state.remove_route(msg_id, pipe)?;
        state.report(&SubscriptionReport::Unsubscribed { msg_id });
        Ok(())
    }

    fn unsubscribe_local(&mut self, msg_id: MsgId, pipe: PipeId) -> Result<(), BusError> {
        let mut state = self.state()?;
        state.remove_route(msg_id, pipe).map(|_| ())
    }

    fn send(&mut self, msg: BusMessage) -> Result<(), BusError> {
        let mut state = self.state()?;
        if state.deliver(&msg) {
            self.shared.1.notify_all();
        }
        Ok(())
    }

    fn receive(&mut self, pipe: PipeId) -> nb::Result<BusMessage, BusError> {
        let mut state = self.state()?;
        state.pipe_mut(pipe)?.queue.pop_front().ok_or(nb::Error::WouldBlock)
    }

    fn receive_timeout(&mut self, pipe: PipeId, timeout: Duration) -> Result<Option<BusMessage>, BusError> {
        let deadline = Instant::now() + timeout;
        let (lock, cvar) = &*self.shared;
        let mut state = lock.lock().map_err(|_| BusError::Poisoned)?;
        loop {
            if let Some(msg) = state.pipe_mut(pipe)?.queue.pop_front() {
                return Ok(Some(msg));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let (guard, _) = cvar
                .wait_timeout(state, deadline - now)
                .map_err(|_| BusError::Poisoned)?;
            state = guard;
        }
    }

    fn enable_subscription_reporting(&mut self) -> Result<(), BusError> {
        self.state()?.reporting = true;
        Ok(())
    }

    fn request_previous_subscriptions(&mut self) -> Result<(), BusError> {
        let mut state = self.state()?;
        let mut entries: Vec<(MsgId, Qos)> = state
            .routes
            .iter()
            .filter(|(_, routes)| routes.iter().any(|r| r.reported))
            .map(|(msg_id, _)| (*msg_id, Qos::default()))
            .filter(|(msg_id, _)| *msg_id != SB_ONESUB_TLM_MID && *msg_id != SB_ALLSUBS_TLM_MID)
            .collect();
        entries.sort_unstable_by_key(|(msg_id, _)| *msg_id);

        let was_reporting = state.reporting;
        state.reporting = true;
        for chunk in entries.chunks(SUB_ENTRIES_PER_PKT) {
            state.report(&SubscriptionReport::All(chunk.to_vec()));
        }
        state.reporting = was_reporting;
        drop(state);
        self.shared.1.notify_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app(name: &str) -> SenderId {
        SenderId::App(name.to_string())
    }

    #[test]
    fn delivers_to_every_subscribed_pipe() {
        let mut bus = LocalBus::new();
        let a = bus.create_pipe("A", 4).unwrap();
        let b = bus.create_pipe("B", 4).unwrap();
        bus.subscribe(0x0900, a).unwrap();
        bus.subscribe(0x0900, b).unwrap();

        bus.send(BusMessage::new(0x0900, vec![1], app("TEST"))).unwrap();

        assert_eq!(bus.receive(a).unwrap().payload, vec![1]);
        assert_eq!(bus.receive(b).unwrap().payload, vec![1]);
        assert!(matches!(bus.receive(a), Err(nb::Error::WouldBlock)));
    }

    #[test]
    fn reporting_emits_one_sub_reports() {
        let mut bus = LocalBus::new();
        let sub_pipe = bus.create_pipe("SUBS", 8).unwrap();
        bus.subscribe_local(SB_ONESUB_TLM_MID, sub_pipe, 8).unwrap();
        let app_pipe = bus.create_pipe("APP", 4).unwrap();

        bus.subscribe(0x0901, app_pipe).unwrap();
        assert!(matches!(bus.receive(sub_pipe), Err(nb::Error::WouldBlock)));

        bus.enable_subscription_reporting().unwrap();
        bus.unsubscribe(0x0901, app_pipe).unwrap();
        let msg = bus.receive(sub_pipe).unwrap();
        assert_eq!(
            SubscriptionReport::decode(msg.msg_id, &msg.payload).unwrap(),
            SubscriptionReport::Unsubscribed { msg_id: 0x0901 }
        );
    }

    #[test]
    fn duplicate_subscribe_is_reported_once() {
        let mut bus = LocalBus::new();
        let sub_pipe = bus.create_pipe("SUBS", 8).unwrap();
        bus.subscribe_local(SB_ONESUB_TLM_MID, sub_pipe, 8).unwrap();
        bus.enable_subscription_reporting().unwrap();
        let app_pipe = bus.create_pipe("APP", 4).unwrap();

        bus.subscribe(0x0904, app_pipe).unwrap();
        bus.subscribe(0x0904, app_pipe).unwrap();

        assert_eq!(bus.pending(sub_pipe), 1);
        assert_eq!(bus.subscribers(0x0904), vec![app_pipe]);
    }

    #[test]
    fn local_subscriptions_are_not_reported() {
        let mut bus = LocalBus::new();
        let sub_pipe = bus.create_pipe("SUBS", 8).unwrap();
        bus.subscribe_local(SB_ONESUB_TLM_MID, sub_pipe, 8).unwrap();
        bus.enable_subscription_reporting().unwrap();
        let peer_pipe = bus.create_pipe("PEER", 4).unwrap();

        bus.subscribe_local(0x0902, peer_pipe, 2).unwrap();
        bus.unsubscribe_local(0x0902, peer_pipe).unwrap();

        assert_eq!(bus.pending(sub_pipe), 0);
    }

    #[test]
    fn per_message_limit_drops_excess() {
        let mut bus = LocalBus::new();
        let pipe = bus.create_pipe("P", 16).unwrap();
        bus.subscribe_local(0x0903, pipe, 2).unwrap();
        for i in 0..3 {
            bus.send(BusMessage::new(0x0903, vec![i], app("TEST"))).unwrap();
        }
        assert_eq!(bus.pending(pipe), 2);
        assert_eq!(bus.dropped(), 1);
    }

    #[test]
    fn previous_subscriptions_are_batched() {
        let mut bus = LocalBus::new();
        let sub_pipe = bus.create_pipe("SUBS", 8).unwrap();
        bus.subscribe_local(SB_ALLSUBS_TLM_MID, sub_pipe, 8).unwrap();
        let app_pipe = bus.create_pipe("APP", 4).unwrap();
        for id in 0..25u16 {
            bus.subscribe(0x0A00 + id, app_pipe).unwrap();
        }

        bus.request_previous_subscriptions().unwrap();

        let first = bus.receive(sub_pipe).unwrap();
        let second = bus.receive(sub_pipe).unwrap();
        let SubscriptionReport::All(a) = SubscriptionReport::decode(first.msg_id, &first.payload).unwrap() else {
            panic!("expected batch report");
        };
        let SubscriptionReport::All(b) = SubscriptionReport::decode(second.msg_id, &second.payload).unwrap() else {
            panic!("expected batch report");
        };
        assert_eq!(a.len(), SUB_ENTRIES_PER_PKT);
        assert_eq!(b.len(), 5);
    }

    #[test]
    fn receive_timeout_returns_none_when_idle() {
        let mut bus = LocalBus::new();
        let pipe = bus.create_pipe("SCH", 2).unwrap();
        let got = bus.receive_timeout(pipe, Duration::from_millis(5)).unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn network_bytes_carry_msg_id() {
        let msg = BusMessage::new(0x0A0B, vec![9, 8], app("TEST"));
        let bytes = msg.to_network_bytes();
        assert_eq!(bytes, vec![0x0A, 0x0B, 9, 8]);
        let back = BusMessage::from_network_bytes(&bytes, SenderId::Network { cpu_id: 2 }).unwrap();
        assert_eq!(back.msg_id, 0x0A0B);
        assert_eq!(back.payload, vec![9, 8]);
        assert!(back.sender.is_network());
    }
}
