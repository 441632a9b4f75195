//! Point-to-point serial links.
//!
//! A host owns the device. A reader thread polls it (opened non-blocking, so
//! a stop request is seen within one poll interval even on an idle line) and
//! parks complete frames in a bounded queue the main loop polls; when the
//! queue is full the oldest frame gives way. Hosts and peers pair up on
//! `(pair_number, baud_rate)`.

use super::{
    expect_fields, parse_field, InterfaceRole, LocalIdentity, ModuleStatus, Transport, TransportError,
    PROTOCOL_SERIAL,
};
use crate::events::EventId;
use crate::peer::{InterfaceId, InterfaceIdentity, PeerName};
use crate::wire::{Frame, WireError, MAX_MSG_SIZE};
use bytes::{Buf, BufMut, BytesMut};
use heapless::Deque;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const SERIAL_QUEUE_DEPTH: usize = 32;
pub const SUPPORTED_BAUD_RATES: [u32; 4] = [38400, 57600, 115200, 230400];

const SERIAL_FIELDS: usize = 3;
/// Reader back-off when the device has nothing to give.
const IDLE_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Default)]
struct QueueState {
    frames: Deque<Frame, SERIAL_QUEUE_DEPTH>,
    dropped: u64,
}

/// Frames handed from a reader thread to the main loop.
#[derive(Debug, Clone, Default)]
pub struct FrameQueue {
    inner: Arc<Mutex<QueueState>>,
}

impl FrameQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `frame`, evicting the oldest one when full. Returns true if a
    /// frame was evicted.
    pub fn push(&self, frame: Frame) -> bool {
        let Ok(mut state) = self.inner.lock() else {
            return false;
        };
        match state.frames.push_back(frame) {
            Ok(()) => false,
            Err(frame) => {
                state.frames.pop_front();
                state.dropped += 1;
                // Room was just made.
                let _ = state.frames.push_back(frame);
                true
            }
        }
    }

    pub fn pop(&self) -> Option<Frame> {
        self.inner.lock().ok()?.frames.pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map_or(0, |s| s.frames.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.inner.lock().map_or(0, |s| s.dropped)
    }

    pub fn clear(&self) {
        if let Ok(mut state) = self.inner.lock() {
            state.frames.clear();
        }
    }
}

#[derive(Debug)]
struct SerialHost {
    writer: Option<File>,
    queue: FrameQueue,
    shutdown: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl SerialHost {
    fn open(device: &Path) -> Result<Self, TransportError> {
        let writer = OpenOptions::new().write(true).open(device)?;
        Ok(Self {
            writer: Some(writer),
            queue: FrameQueue::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
            reader: None,
        })
    }

    fn start_reader(&mut self, device: &Path, pair_number: u32) -> Result<(), TransportError> {
        let file = open_nonblocking(device)?;
        self.shutdown.store(false, Ordering::SeqCst);
        let queue = self.queue.clone();
        let shutdown = Arc::clone(&self.shutdown);
        let handle = thread::Builder::new()
            .name(format!("sbn-serial-{pair_number}"))
            .spawn(move || read_loop(file, queue, shutdown, pair_number))?;
        self.reader = Some(handle);
        Ok(())
    }

    fn stop_reader(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.reader.take() {
            if handle.join().is_err() {
                warn!(eid = %EventId::Transport, "serial reader panicked");
            }
        }
    }
}

/// The reader must never park in `read`, or stopping it would hang on an idle
/// line.
fn open_nonblocking(device: &Path) -> std::io::Result<File> {
    OpenOptions::new().read(true).custom_flags(libc::O_NONBLOCK).open(device)
}

/// Reads frames off the device until told to stop or the device fails.
fn read_loop(mut device: File, queue: FrameQueue, shutdown: Arc<AtomicBool>, pair_number: u32) {
    let mut chunk = [0u8; MAX_MSG_SIZE];
    let mut pending = BytesMut::with_capacity(MAX_MSG_SIZE * 2);

    while !shutdown.load(Ordering::SeqCst) {
        match device.read(&mut chunk) {
            Ok(0) => thread::sleep(IDLE_POLL),
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(IDLE_POLL),
            Ok(n) => {
                pending.put_slice(&chunk[..n]);
                loop {
                    match Frame::decode_prefix(&pending) {
                        Ok((frame, used)) => {
                            pending.advance(used);
                            if queue.push(frame) {
                                warn!(eid = %EventId::Transport, pair_number, "serial queue full, oldest frame dropped");
                            }
                        }
                        Err(WireError::Truncated { .. }) => break,
                        Err(e) => {
                            warn!(eid = %EventId::Transport, pair_number, "discarding unreadable serial data: {e}");
                            pending.clear();
                            break;
                        }
                    }
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                error!(eid = %EventId::Transport, pair_number, "serial read failed: {e}");
                break;
            }
        }
    }
    info!(eid = %EventId::Transport, pair_number, "serial read task exiting");
}

#[derive(Debug)]
struct SerialInterface {
    name: PeerName,
    pair_number: u32,
    device: PathBuf,
    baud_rate: u32,
    role: Option<InterfaceRole>,
    host: Option<SerialHost>,
}

impl SerialInterface {
    fn pairs_with(&self, other: &SerialInterface) -> bool {
        self.pair_number == other.pair_number && self.baud_rate == other.baud_rate
    }
}

#[derive(Debug, Default)]
pub struct SerialTransport {
    interfaces: Vec<SerialInterface>,
}

impl SerialTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn iface(&self, id: InterfaceId) -> Result<&SerialInterface, TransportError> {
        self.interfaces.get(id).ok_or(TransportError::UnknownInterface(id))
    }

    /// The open host paired with `peer`.
    fn matching_host(&self, peer: InterfaceId) -> Result<InterfaceId, TransportError> {
        let peer_iface = self.iface(peer)?;
        self.interfaces
            .iter()
            .position(|h| h.role == Some(InterfaceRole::Host) && h.host.is_some() && h.pairs_with(peer_iface))
            .ok_or(TransportError::NoHost)
    }

    fn host_mut(&mut self, id: InterfaceId) -> Result<(&PathBuf, u32, &mut SerialHost), TransportError> {
        let iface = self.interfaces.get_mut(id).ok_or(TransportError::UnknownInterface(id))?;
        let host = iface.host.as_mut().ok_or(TransportError::WrongRole(id))?;
        Ok((&iface.device, iface.pair_number, host))
    }

    /// Frames waiting on host `id`.
    pub fn queued(&self, id: InterfaceId) -> usize {
        self.interfaces
            .get(id)
            .and_then(|i| i.host.as_ref())
            .map_or(0, |h| h.queue.len())
    }
}

impl Transport for SerialTransport {
    fn protocol_id(&self) -> u8 {
        PROTOCOL_SERIAL
    }

    fn name(&self) -> &'static str {
        "Serial"
    }

    fn load_entry(&mut self, identity: &InterfaceIdentity, fields: &[&str]) -> Result<InterfaceId, TransportError> {
        expect_fields(fields, SERIAL_FIELDS)?;
        let pair_number: u32 = parse_field(fields[0], "pair_number")?;
        let device = PathBuf::from(fields[1]);
        let baud_rate: u32 = parse_field(fields[2], "baud_rate")?;
        if !SUPPORTED_BAUD_RATES.contains(&baud_rate) {
            return Err(TransportError::BadField { field: "baud_rate", value: fields[2].to_string() });
        }
        self.interfaces.push(SerialInterface {
            name: identity.name,
            pair_number,
            device,
            baud_rate,
            role: None,
            host: None,
        });
        Ok(self.interfaces.len() - 1)
    }

    fn init_interface(&mut self, id: InterfaceId, local: &LocalIdentity) -> Result<InterfaceRole, TransportError> {
        let iface = self.interfaces.get_mut(id).ok_or(TransportError::UnknownInterface(id))?;
        let role = if iface.name == local.cpu_name {
            iface.host = Some(SerialHost::open(&iface.device)?);
            InterfaceRole::Host
        } else {
            InterfaceRole::Peer
        };
        iface.role = Some(role);
        Ok(role)
    }

    fn send(&mut self, peer: InterfaceId, frame: &Frame) -> Result<usize, TransportError> {
        let host_id = self.matching_host(peer)?;
        let bytes = frame.encode()?;
        let (_, _, host) = self.host_mut(host_id)?;
        let writer = host.writer.as_mut().ok_or(TransportError::LinkDown)?;
        writer.write_all(&bytes)?;
        writer.flush()?;
        Ok(bytes.len())
    }

    fn receive(&mut self, host: InterfaceId) -> nb::Result<Frame, TransportError> {
        let (_, _, host) = self.host_mut(host)?;
        host.queue.pop().ok_or(nb::Error::WouldBlock)
    }

    fn verify_peer(&mut self, peer: InterfaceId, hosts: &[InterfaceId]) -> bool {
        let Ok(peer_iface) = self.iface(peer) else {
            return false;
        };
        hosts
            .iter()
            .filter_map(|h| self.interfaces.get(*h))
            .any(|h| h.pairs_with(peer_iface))
    }

    fn verify_host(&mut self, host: InterfaceId, peers: &[InterfaceId]) -> bool {
        let Ok(host_iface) = self.iface(host) else {
            return false;
        };
        let paired = peers
            .iter()
            .filter_map(|p| self.interfaces.get(*p))
            .any(|p| p.pairs_with(host_iface));
        if !paired {
            return false;
        }
        let Ok((device, pair_number, serial_host)) = self.host_mut(host) else {
            return false;
        };
        let device = device.clone();
        match serial_host.start_reader(&device, pair_number) {
            Ok(()) => {
                debug!(eid = %EventId::Transport, pair_number, "serial read task started");
                true
            }
            Err(e) => {
                error!(eid = %EventId::Transport, pair_number, "cannot start serial read task: {e}");
                false
            }
        }
    }

    fn report_status(&mut self, peer: InterfaceId, _hosts: &[InterfaceId]) -> Result<ModuleStatus, TransportError> {
        let host_id = self.matching_host(peer)?;
        let iface = self.iface(host_id)?;
        let (queued, dropped, reading) = iface.host.as_ref().map_or((0, 0, false), |h| {
            (h.queue.len(), h.queue.dropped(), h.reader.is_some())
        });

        let mut raw = Vec::with_capacity(21);
        raw.put_u32(iface.pair_number);
        raw.put_u32(iface.baud_rate);
        raw.put_u32(queued as u32);
        raw.put_u64(dropped);
        raw.put_u8(reading as u8);
        Ok(ModuleStatus {
            protocol_id: PROTOCOL_SERIAL,
            detail: format!(
                "pair {} on {} at {} baud, {} queued, {} dropped",
                iface.pair_number,
                iface.device.display(),
                iface.baud_rate,
                queued,
                dropped
            ),
            raw,
        })
    }

    fn reset_peer(&mut self, peer: InterfaceId, _hosts: &[InterfaceId]) -> Result<(), TransportError> {
        let host_id = self.matching_host(peer)?;
        let (device, pair_number, host) = self.host_mut(host_id)?;
        let device = device.clone();

        host.stop_reader();
        host.writer = None;
        host.queue.clear();
        host.writer = Some(OpenOptions::new().write(true).open(&device)?);
        host.start_reader(&device, pair_number)?;
        info!(eid = %EventId::Transport, pair_number, "serial link reset");
        Ok(())
    }

    fn shutdown(&mut self) {
        for host in self.interfaces.iter_mut().filter_map(|i| i.host.as_mut()) {
            host.stop_reader();
            host.writer = None;
        }
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}
