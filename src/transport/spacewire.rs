//! SpaceWire packet links over a character device.
//!
//! Each write carries exactly one frame. Reads are buffered and split back
//! into frames, so a device that coalesces packets still works. Link state
//! comes from a sysfs-style `link_status` file holding a single integer.

use super::{
    expect_fields, InterfaceRole, LocalIdentity, ModuleStatus, Transport, TransportError, PROTOCOL_SPACEWIRE_PKT,
};
use crate::events::EventId;
use crate::peer::{InterfaceId, InterfaceIdentity, PeerName};
use crate::wire::{Frame, WireError, MAX_MSG_SIZE};
use bytes::{Buf, BufMut, BytesMut};
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const SPACEWIRE_FIELDS: usize = 2;
pub const LINK_STATUS_FILE: &str = "link_status";

#[derive(Debug)]
struct SpaceWireInterface {
    name: PeerName,
    device_class: String,
    device_instance: String,
    role: Option<InterfaceRole>,
    device: Option<File>,
    pending: BytesMut,
}

#[derive(Debug)]
pub struct SpaceWireTransport {
    dev_root: PathBuf,
    sysfs_root: PathBuf,
    interfaces: Vec<SpaceWireInterface>,
}

impl Default for SpaceWireTransport {
    fn default() -> Self {
        Self::with_roots("/dev", "/sys/class")
    }
}

impl SpaceWireTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks for devices under `dev_root` and link status under `sysfs_root`.
    pub fn with_roots(dev_root: impl Into<PathBuf>, sysfs_root: impl Into<PathBuf>) -> Self {
        Self { dev_root: dev_root.into(), sysfs_root: sysfs_root.into(), interfaces: Vec::new() }
    }

    pub fn device_path(&self, device_class: &str, device_instance: &str) -> PathBuf {
        self.dev_root.join(format!("{device_class}{device_instance}"))
    }

    pub fn status_path(&self, device_class: &str, device_instance: &str) -> PathBuf {
        self.sysfs_root
            .join(device_class)
            .join(format!("{device_class}{device_instance}"))
            .join(LINK_STATUS_FILE)
    }

    fn link_status(&self, id: InterfaceId) -> Result<i32, TransportError> {
        let iface = self.interfaces.get(id).ok_or(TransportError::UnknownInterface(id))?;
        read_status(&self.status_path(&iface.device_class, &iface.device_instance))
    }
}

fn read_status(path: &Path) -> Result<i32, TransportError> {
    let text = std::fs::read_to_string(path)?;
    text.trim()
        .parse()
        .map_err(|_| TransportError::BadField { field: LINK_STATUS_FILE, value: text.trim().to_string() })
}

impl Transport for SpaceWireTransport {
    fn protocol_id(&self) -> u8 {
        PROTOCOL_SPACEWIRE_PKT
    }

    fn name(&self) -> &'static str {
        "SpaceWire"
    }

    fn load_entry(&mut self, identity: &InterfaceIdentity, fields: &[&str]) -> Result<InterfaceId, TransportError> {
        expect_fields(fields, SPACEWIRE_FIELDS)?;
        for (field, value) in [("device_class", fields[0]), ("device_instance", fields[1])] {
            if value.is_empty() || value.contains('/') {
                return Err(TransportError::BadField { field, value: value.to_string() });
            }
        }
        self.interfaces.push(SpaceWireInterface {
            name: identity.name,
            device_class: fields[0].to_string(),
            device_instance: fields[1].to_string(),
            role: None,
            device: None,
            pending: BytesMut::new(),
        });
        Ok(self.interfaces.len() - 1)
    }

    fn init_interface(&mut self, id: InterfaceId, local: &LocalIdentity) -> Result<InterfaceRole, TransportError> {
        let iface = self.interfaces.get(id).ok_or(TransportError::UnknownInterface(id))?;
        let path = self.device_path(&iface.device_class, &iface.device_instance);
        let role = if iface.name == local.cpu_name { InterfaceRole::Host } else { InterfaceRole::Peer };
        let device = match role {
            InterfaceRole::Host => OpenOptions::new().read(true).open(&path)?,
            InterfaceRole::Peer => OpenOptions::new().append(true).open(&path)?,
        };
        debug!(eid = %EventId::Transport, path = %path.display(), ?role, "SpaceWire device opened");

        let iface = &mut self.interfaces[id];
        iface.device = Some(device);
        iface.role = Some(role);
        Ok(role)
    }

    fn send(&mut self, peer: InterfaceId, frame: &Frame) -> Result<usize, TransportError> {
        let iface = self.interfaces.get_mut(peer).ok_or(TransportError::UnknownInterface(peer))?;
        if iface.role != Some(InterfaceRole::Peer) {
            return Err(TransportError::WrongRole(peer));
        }
        let device = iface.device.as_mut().ok_or(TransportError::LinkDown)?;
        let bytes = frame.encode()?;
        device.write_all(&bytes)?;
        Ok(bytes.len())
    }

    fn receive(&mut self, host: InterfaceId) -> nb::Result<Frame, TransportError> {
        let iface = self.interfaces.get_mut(host).ok_or(TransportError::UnknownInterface(host))?;
        if iface.role != Some(InterfaceRole::Host) {
            return Err(TransportError::WrongRole(host).into());
        }
        loop {
            match Frame::decode_prefix(&iface.pending) {
                Ok((frame, used)) => {
                    iface.pending.advance(used);
                    return Ok(frame);
                }
                Err(WireError::Truncated { .. }) => {}
                Err(e) => {
                    iface.pending.clear();
                    return Err(nb::Error::Other(e.into()));
                }
            }

            let device = iface.device.as_mut().ok_or(TransportError::LinkDown)?;
            let mut chunk = [0u8; MAX_MSG_SIZE];
            match device.read(&mut chunk) {
                Ok(0) => return Err(nb::Error::WouldBlock),
                Ok(n) => iface.pending.put_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Err(nb::Error::WouldBlock),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!(eid = %EventId::Transport, "SpaceWire read failed: {e}");
                    return Err(nb::Error::Other(e.into()));
                }
            }
        }
    }

    fn verify_peer(&mut self, _peer: InterfaceId, hosts: &[InterfaceId]) -> bool {
        hosts
            .iter()
            .any(|h| self.interfaces.get(*h).is_some_and(|i| i.role == Some(InterfaceRole::Host)))
    }

    fn verify_host(&mut self, _host: InterfaceId, _peers: &[InterfaceId]) -> bool {
        true
    }

    fn report_status(&mut self, peer: InterfaceId, _hosts: &[InterfaceId]) -> Result<ModuleStatus, TransportError> {
        let status = self.link_status(peer)?;
        let mut raw = Vec::with_capacity(4);
        raw.put_i32(status);
        Ok(ModuleStatus {
            protocol_id: PROTOCOL_SPACEWIRE_PKT,
            detail: format!("link {}", if status != 0 { "up" } else { "down" }),
            raw,
        })
    }

    fn shutdown(&mut self) {
        for iface in &mut self.interfaces {
            iface.device = None;
            iface.pending.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_follow_class_and_instance() {
        let spw = SpaceWireTransport::with_roots("/dev", "/sys/class");
        assert_eq!(spw.device_path("spw", "0"), PathBuf::from("/dev/spw0"));
        assert_eq!(
            spw.status_path("spw", "0"),
            PathBuf::from("/sys/class/spw/spw0/link_status")
        );
    }

    #[test]
    fn rejects_path_separators() {
        let mut spw = SpaceWireTransport::new();
        let identity = InterfaceIdentity {
            name: PeerName::from("CPU1").unwrap(),
            processor_id: 1,
            protocol_id: PROTOCOL_SPACEWIRE_PKT,
            spacecraft_id: 0x42,
            qos: 0,
        };
        let err = spw.load_entry(&identity, &["../spw", "0"]).unwrap_err();
        assert!(matches!(err, TransportError::BadField { field: "device_class", .. }));
    }
}
