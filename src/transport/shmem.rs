//! Shared-memory links.
//!
//! Two nodes share one file-backed segment. Each direction is a
//! single-producer/single-consumer byte ring:
//!
//! ```text
//! +-------------------+--------------------+---------------------------+
//! | read offset (u32) | write offset (u32) | data (segment_size - 8)   |
//! +-------------------+--------------------+---------------------------+
//! ```
//!
//! Frames are stored exactly as on the wire and may wrap around the end of
//! the data area. One byte is always left free so a full ring is never
//! mistaken for an empty one.
//!
//! Each offset word belongs to one side: the writer publishes its offset
//! with release ordering after the frame bytes, the reader does the same
//! for the read offset. A reset on the reading side never touches the
//! writer's word; it drops pending input by catching up to it.

use super::{
    expect_fields, parse_field, InterfaceRole, LocalIdentity, ModuleStatus, Transport, TransportError,
    PROTOCOL_SHMEM,
};
use crate::events::EventId;
use crate::peer::{InterfaceId, InterfaceIdentity, PeerName};
use crate::wire::{decode_header, Frame, WireError, HEADER_SIZE};
use bytes::BufMut;
use memmap2::MmapMut;
use std::fs::OpenOptions;
use std::marker::PhantomData;
use std::mem;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, warn};

const SHMEM_FIELDS: usize = 4;
pub const RING_HEADER_SIZE: usize = 8;
const READ_WORD: usize = 0;
const WRITE_WORD: usize = 4;
/// Smallest ring that can carry an empty frame.
pub const MIN_SEGMENT_SIZE: usize = RING_HEADER_SIZE + HEADER_SIZE + 1;

/// A byte ring laid over a slice of the segment.
///
/// The two offset words are atomics shared with the other process. The writer
/// owns the write offset and publishes it with `Release` after the bytes; the
/// reader owns the read offset and publishes it with `Release` after copying a
/// frame out. Each side loads the other's word with `Acquire`.
pub struct Ring<'a> {
    base: *mut u8,
    len: usize,
    _region: PhantomData<&'a mut [u8]>,
}

impl<'a> Ring<'a> {
    /// Wraps `region`, which must be 4-byte aligned and hold at least a
    /// header plus one empty frame.
    pub fn new(region: &'a mut [u8]) -> Result<Self, TransportError> {
        let base = region.as_mut_ptr();
        if region.len() < MIN_SEGMENT_SIZE || base.align_offset(mem::align_of::<AtomicU32>()) != 0 {
            return Err(TransportError::BadRing { len: region.len() });
        }
        Ok(Self { base, len: region.len(), _region: PhantomData })
    }

    fn capacity(&self) -> usize {
        self.len - RING_HEADER_SIZE
    }

    #[allow(clippy::cast_ptr_alignment)]
    fn word(&self, at: usize) -> &AtomicU32 {
        debug_assert!(at == READ_WORD || at == WRITE_WORD);
        // Safety: `new` checked alignment and length, and the region is
        // borrowed for 'a. All access to the word goes through the atomic.
        unsafe { &*self.base.add(at).cast::<AtomicU32>() }
    }

    fn read_offset(&self) -> usize {
        self.word(READ_WORD).load(Ordering::Acquire) as usize % self.capacity()
    }

    fn write_offset(&self) -> usize {
        self.word(WRITE_WORD).load(Ordering::Acquire) as usize % self.capacity()
    }

    /// Bytes waiting to be read.
    pub fn used(&self) -> usize {
        let (r, w) = (self.read_offset(), self.write_offset());
        (w + self.capacity() - r) % self.capacity()
    }

    pub fn free(&self) -> usize {
        self.capacity() - self.used() - 1
    }

    fn data_ptr(&self, pos: usize) -> *mut u8 {
        // Safety: `pos % capacity` stays inside the data area.
        unsafe { self.base.add(RING_HEADER_SIZE + pos % self.capacity()) }
    }

    fn copy_out(&self, from: usize, out: &mut [u8]) {
        for (i, byte) in out.iter_mut().enumerate() {
            // Safety: the reader only touches bytes between its read offset
            // and the published write offset, which the writer leaves alone.
            *byte = unsafe { self.data_ptr(from + i).read() };
        }
    }

    pub fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        if bytes.len() > self.free() {
            return Err(TransportError::RingFull);
        }
        let w = self.write_offset();
        for (i, byte) in bytes.iter().enumerate() {
            // Safety: these bytes are free, so the reader is not looking at them.
            unsafe { self.data_ptr(w + i).write(*byte) };
        }
        let next = (w + bytes.len()) % self.capacity();
        self.word(WRITE_WORD).store(next as u32, Ordering::Release);
        Ok(())
    }

    /// Takes the next complete frame. A corrupt header discards everything
    /// currently in the ring.
    pub fn read_frame(&mut self) -> nb::Result<Frame, TransportError> {
        let used = self.used();
        if used < HEADER_SIZE {
            return Err(nb::Error::WouldBlock);
        }
        let r = self.read_offset();
        let mut header = [0u8; HEADER_SIZE];
        self.copy_out(r, &mut header);
        let header = match decode_header(&header) {
            Ok(h) => h,
            Err(e) => {
                self.reset();
                return Err(nb::Error::Other(e.into()));
            }
        };
        let total = HEADER_SIZE + usize::from(header.msg_size);
        if used < total {
            // Writer publishes the offset after the bytes, so this is corruption.
            self.reset();
            return Err(nb::Error::Other(
                WireError::Truncated { needed: total, available: used }.into(),
            ));
        }
        let mut payload = vec![0u8; usize::from(header.msg_size)];
        self.copy_out(r + HEADER_SIZE, &mut payload);
        let next = (r + total) % self.capacity();
        self.word(READ_WORD).store(next as u32, Ordering::Release);
        Ok(Frame::new(header.msg_type, header.cpu_id, payload))
    }

    /// Reader side: skips everything written so far. The write offset belongs
    /// to the other process and is left alone.
    pub fn reset(&mut self) {
        let w = self.word(WRITE_WORD).load(Ordering::Acquire);
        self.word(READ_WORD).store(w, Ordering::Release);
    }
}

#[derive(Debug)]
struct ShmemInterface {
    name: PeerName,
    segment_path: PathBuf,
    send_offset: usize,
    recv_offset: usize,
    segment_size: usize,
    role: Option<InterfaceRole>,
    map: Option<MmapMut>,
}

impl ShmemInterface {
    /// A host and a peer match when they share a segment with crossed rings.
    fn crosses(&self, other: &ShmemInterface) -> bool {
        self.segment_path == other.segment_path
            && self.send_offset == other.recv_offset
            && self.recv_offset == other.send_offset
            && self.segment_size == other.segment_size
    }

    fn ring(&mut self, offset: usize) -> Result<Ring<'_>, TransportError> {
        let size = self.segment_size;
        let map = self.map.as_mut().ok_or(TransportError::LinkDown)?;
        Ring::new(&mut map[offset..offset + size])
    }
}

#[derive(Debug, Default)]
pub struct ShmemTransport {
    interfaces: Vec<ShmemInterface>,
}

impl ShmemTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn matching_host(&self, peer: InterfaceId) -> Result<InterfaceId, TransportError> {
        let peer_iface = self.interfaces.get(peer).ok_or(TransportError::UnknownInterface(peer))?;
        self.interfaces
            .iter()
            .position(|h| h.role == Some(InterfaceRole::Host) && h.map.is_some() && h.crosses(peer_iface))
            .ok_or(TransportError::NoHost)
    }

    fn map_segment(iface: &ShmemInterface) -> Result<MmapMut, TransportError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&iface.segment_path)?;
        let needed = (iface.send_offset.max(iface.recv_offset) + iface.segment_size) as u64;
        if file.metadata()?.len() < needed {
            file.set_len(needed)?;
        }
        // Safety: the segment is only ever accessed through this map and the
        // peer's map of the same file, each side writing only the offset it owns.
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(map)
    }
}

impl Transport for ShmemTransport {
    fn protocol_id(&self) -> u8 {
        PROTOCOL_SHMEM
    }

    fn name(&self) -> &'static str {
        "ShMem"
    }

    fn load_entry(&mut self, identity: &InterfaceIdentity, fields: &[&str]) -> Result<InterfaceId, TransportError> {
        expect_fields(fields, SHMEM_FIELDS)?;
        let segment_path = PathBuf::from(fields[0]);
        let send_offset: usize = parse_field(fields[1], "send_offset")?;
        let recv_offset: usize = parse_field(fields[2], "recv_offset")?;
        let segment_size: usize = parse_field(fields[3], "segment_size")?;
        if segment_size < MIN_SEGMENT_SIZE || segment_size > u32::MAX as usize {
            return Err(TransportError::BadField { field: "segment_size", value: fields[3].to_string() });
        }
        for (field, offset, value) in [("send_offset", send_offset, fields[1]), ("recv_offset", recv_offset, fields[2])] {
            if offset % mem::align_of::<AtomicU32>() != 0 {
                return Err(TransportError::BadField { field, value: value.to_string() });
            }
        }
        let overlap = send_offset < recv_offset + segment_size && recv_offset < send_offset + segment_size;
        if overlap {
            return Err(TransportError::BadField { field: "recv_offset", value: fields[2].to_string() });
        }
        self.interfaces.push(ShmemInterface {
            name: identity.name,
            segment_path,
            send_offset,
            recv_offset,
            segment_size,
            role: None,
            map: None,
        });
        Ok(self.interfaces.len() - 1)
    }

    fn init_interface(&mut self, id: InterfaceId, local: &LocalIdentity) -> Result<InterfaceRole, TransportError> {
        let iface = self.interfaces.get_mut(id).ok_or(TransportError::UnknownInterface(id))?;
        let role = if iface.name == local.cpu_name {
            iface.map = Some(Self::map_segment(iface)?);
            let recv = iface.recv_offset;
            iface.ring(recv)?.reset();
            debug!(eid = %EventId::Transport, path = %iface.segment_path.display(), "shared memory segment mapped");
            InterfaceRole::Host
        } else {
            InterfaceRole::Peer
        };
        iface.role = Some(role);
        Ok(role)
    }

    fn send(&mut self, peer: InterfaceId, frame: &Frame) -> Result<usize, TransportError> {
        let host_id = self.matching_host(peer)?;
        let mut bytes = Vec::with_capacity(frame.encoded_len());
        frame.encode_into(&mut bytes)?;
        let host = &mut self.interfaces[host_id];
        let send = host.send_offset;
        host.ring(send)?.write(&bytes)?;
        Ok(bytes.len())
    }

    fn receive(&mut self, host: InterfaceId) -> nb::Result<Frame, TransportError> {
        let iface = self.interfaces.get_mut(host).ok_or(TransportError::UnknownInterface(host))?;
        let recv = iface.recv_offset;
        let mut ring = iface.ring(recv)?;
        ring.read_frame().map_err(|e| {
            if let nb::Error::Other(err) = &e {
                warn!(eid = %EventId::Transport, "shared memory receive ring reset: {err}");
            }
            e
        })
    }

    fn verify_peer(&mut self, peer: InterfaceId, hosts: &[InterfaceId]) -> bool {
        let Some(peer_iface) = self.interfaces.get(peer) else {
            return false;
        };
        hosts
            .iter()
            .filter_map(|h| self.interfaces.get(*h))
            .any(|h| h.crosses(peer_iface))
    }

    fn verify_host(&mut self, host: InterfaceId, peers: &[InterfaceId]) -> bool {
        let Some(host_iface) = self.interfaces.get(host) else {
            return false;
        };
        peers
            .iter()
            .filter_map(|p| self.interfaces.get(*p))
            .any(|p| p.crosses(host_iface))
    }

    fn report_status(&mut self, peer: InterfaceId, _hosts: &[InterfaceId]) -> Result<ModuleStatus, TransportError> {
        let host_id = self.matching_host(peer)?;
        let host = &mut self.interfaces[host_id];
        let (send, recv) = (host.send_offset, host.recv_offset);
        let (send_used, send_free) = {
            let ring = host.ring(send)?;
            (ring.used(), ring.free())
        };
        let (recv_used, recv_free) = {
            let ring = host.ring(recv)?;
            (ring.used(), ring.free())
        };

        let mut raw = Vec::with_capacity(16);
        raw.put_u32(send_used as u32);
        raw.put_u32(send_free as u32);
        raw.put_u32(recv_used as u32);
        raw.put_u32(recv_free as u32);
        Ok(ModuleStatus {
            protocol_id: PROTOCOL_SHMEM,
            detail: format!(
                "{}: send ring {} used / {} free, receive ring {} used / {} free",
                host.segment_path.display(),
                send_used,
                send_free,
                recv_used,
                recv_free
            ),
            raw,
        })
    }

    fn reset_peer(&mut self, peer: InterfaceId, _hosts: &[InterfaceId]) -> Result<(), TransportError> {
        let host_id = self.matching_host(peer)?;
        let host = &mut self.interfaces[host_id];
        let recv = host.recv_offset;
        host.ring(recv)?.reset();
        Ok(())
    }

    fn shutdown(&mut self) {
        for iface in &mut self.interfaces {
            if let Some(map) = iface.map.take() {
                if let Err(e) = map.flush() {
                    warn!(eid = %EventId::Transport, "flushing shared memory segment failed: {e}");
                }
            }
        }
    }
}
