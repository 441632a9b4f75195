//! UDP/IPv4 links.
//!
//! The entry whose processor id is our own is the host: it binds one
//! non-blocking socket that both receives from and sends to every IPv4 peer.

use super::{expect_fields, parse_field, InterfaceRole, LocalIdentity, Transport, TransportError, PROTOCOL_IPV4};
use crate::events::EventId;
use crate::peer::{InterfaceId, InterfaceIdentity};
use crate::wire::{CpuId, Frame, MAX_MSG_SIZE};
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use tracing::{debug, warn};

const IPV4_FIELDS: usize = 2;
/// Upper bound on datagrams discarded when a fresh socket is bound.
const CLEAR_SOCKET_LIMIT: usize = 50;

#[derive(Debug)]
struct UdpInterface {
    cpu_id: CpuId,
    addr: SocketAddrV4,
    role: Option<InterfaceRole>,
    socket: Option<UdpSocket>,
}

#[derive(Debug, Default)]
pub struct UdpTransport {
    interfaces: Vec<UdpInterface>,
}

impl UdpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Address bound by host `id`, once initialised. Port 0 entries report
    /// the port the OS picked.
    pub fn local_addr(&self, id: InterfaceId) -> Option<SocketAddr> {
        self.interfaces.get(id)?.socket.as_ref()?.local_addr().ok()
    }

    /// Points peer `id` at a different address.
    pub fn set_peer_addr(&mut self, id: InterfaceId, addr: SocketAddrV4) -> Result<(), TransportError> {
        let iface = self.interfaces.get_mut(id).ok_or(TransportError::UnknownInterface(id))?;
        iface.addr = addr;
        Ok(())
    }

    fn host_socket(&self) -> Option<&UdpSocket> {
        self.interfaces
            .iter()
            .filter(|i| i.role == Some(InterfaceRole::Host))
            .find_map(|i| i.socket.as_ref())
    }
}

fn bind(addr: SocketAddrV4) -> Result<UdpSocket, TransportError> {
    debug!(eid = %EventId::Transport, "creating socket for {addr}");
    let socket = UdpSocket::bind(addr)?;
    socket.set_nonblocking(true)?;
    clear_socket(&socket);
    Ok(socket)
}

/// Drops anything queued on the socket before we start listening.
fn clear_socket(socket: &UdpSocket) {
    let mut discard = [0u8; MAX_MSG_SIZE];
    for _ in 0..CLEAR_SOCKET_LIMIT {
        if socket.recv_from(&mut discard).is_err() {
            break;
        }
    }
}

impl Transport for UdpTransport {
    fn protocol_id(&self) -> u8 {
        PROTOCOL_IPV4
    }

    fn name(&self) -> &'static str {
        "IPv4"
    }

    fn load_entry(&mut self, identity: &InterfaceIdentity, fields: &[&str]) -> Result<InterfaceId, TransportError> {
        expect_fields(fields, IPV4_FIELDS)?;
        let ip: Ipv4Addr = parse_field(fields[0], "address")?;
        let port: u16 = parse_field(fields[1], "port")?;
        self.interfaces.push(UdpInterface {
            cpu_id: identity.processor_id,
            addr: SocketAddrV4::new(ip, port),
            role: None,
            socket: None,
        });
        Ok(self.interfaces.len() - 1)
    }

    fn init_interface(&mut self, id: InterfaceId, local: &LocalIdentity) -> Result<InterfaceRole, TransportError> {
        let iface = self.interfaces.get_mut(id).ok_or(TransportError::UnknownInterface(id))?;
        let role = if iface.cpu_id == local.cpu_id {
            iface.socket = Some(bind(iface.addr)?);
            InterfaceRole::Host
        } else {
            InterfaceRole::Peer
        };
        iface.role = Some(role);
        Ok(role)
    }

    fn send(&mut self, peer: InterfaceId, frame: &Frame) -> Result<usize, TransportError> {
        let iface = self.interfaces.get(peer).ok_or(TransportError::UnknownInterface(peer))?;
        if iface.role != Some(InterfaceRole::Peer) {
            return Err(TransportError::WrongRole(peer));
        }
        let socket = self.host_socket().ok_or(TransportError::NoHost)?;
        let bytes = frame.encode()?;
        Ok(socket.send_to(&bytes, iface.addr)?)
    }

    fn receive(&mut self, host: InterfaceId) -> nb::Result<Frame, TransportError> {
        let iface = self.interfaces.get(host).ok_or(TransportError::UnknownInterface(host))?;
        let socket = iface.socket.as_ref().ok_or(TransportError::WrongRole(host))?;
        let mut buf = [0u8; MAX_MSG_SIZE];
        match socket.recv_from(&mut buf) {
            Ok((0, _)) => Err(nb::Error::WouldBlock),
            Ok((len, from)) => Frame::decode(&buf[..len]).map_err(|e| {
                warn!(eid = %EventId::Transport, %from, "dropping malformed datagram: {e}");
                nb::Error::Other(e.into())
            }),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Err(nb::Error::WouldBlock),
            Err(e) => Err(nb::Error::Other(e.into())),
        }
    }

    fn verify_peer(&mut self, _peer: InterfaceId, hosts: &[InterfaceId]) -> bool {
        hosts
            .iter()
            .any(|h| self.interfaces.get(*h).is_some_and(|i| i.socket.is_some()))
    }

    fn verify_host(&mut self, _host: InterfaceId, _peers: &[InterfaceId]) -> bool {
        true
    }

    fn shutdown(&mut self) {
        for iface in &mut self.interfaces {
            iface.socket = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PeerName;
    use crate::wire::MsgType;

    fn identity(cpu: CpuId) -> InterfaceIdentity {
        InterfaceIdentity {
            name: PeerName::from("CPU").unwrap(),
            processor_id: cpu,
            protocol_id: PROTOCOL_IPV4,
            spacecraft_id: 0x42,
            qos: 0,
        }
    }

    fn local(cpu: CpuId) -> LocalIdentity {
        LocalIdentity { cpu_id: cpu, cpu_name: PeerName::from("CPU").unwrap() }
    }

    #[test]
    fn rejects_bad_address() {
        let mut udp = UdpTransport::new();
        let err = udp.load_entry(&identity(1), &["300.0.0.1", "2234"]).unwrap_err();
        assert!(matches!(err, TransportError::BadField { field: "address", .. }));
    }

    #[test]
    fn own_cpu_is_host_other_is_peer() {
        let mut udp = UdpTransport::new();
        let host = udp.load_entry(&identity(1), &["127.0.0.1", "0"]).unwrap();
        let peer = udp.load_entry(&identity(2), &["127.0.0.1", "2235"]).unwrap();
        assert_eq!(udp.init_interface(host, &local(1)).unwrap(), InterfaceRole::Host);
        assert_eq!(udp.init_interface(peer, &local(1)).unwrap(), InterfaceRole::Peer);
        assert!(udp.verify_peer(peer, &[host]));
        assert!(udp.local_addr(host).is_some());
    }

    #[test]
    fn empty_socket_would_block() {
        let mut udp = UdpTransport::new();
        let host = udp.load_entry(&identity(1), &["127.0.0.1", "0"]).unwrap();
        udp.init_interface(host, &local(1)).unwrap();
        assert!(matches!(udp.receive(host), Err(nb::Error::WouldBlock)));
    }

    #[test]
    fn loopback_frame_round_trip() {
        let mut a = UdpTransport::new();
        let a_host = a.load_entry(&identity(1), &["127.0.0.1", "0"]).unwrap();
        let a_peer = a.load_entry(&identity(2), &["127.0.0.1", "1"]).unwrap();
        a.init_interface(a_host, &local(1)).unwrap();
        a.init_interface(a_peer, &local(1)).unwrap();

        let mut b = UdpTransport::new();
        let b_host = b.load_entry(&identity(2), &["127.0.0.1", "0"]).unwrap();
        b.init_interface(b_host, &local(2)).unwrap();
        let Some(SocketAddr::V4(b_addr)) = b.local_addr(b_host) else {
            panic!("host not bound");
        };
        a.set_peer_addr(a_peer, b_addr).unwrap();

        let frame = Frame::new(MsgType::Heartbeat, 1, vec![]);
        assert_eq!(a.send(a_peer, &frame).unwrap(), 7);

        let mut got = None;
        for _ in 0..200 {
            match b.receive(b_host) {
                Ok(f) => {
                    got = Some(f);
                    break;
                }
                Err(nb::Error::WouldBlock) => std::thread::sleep(std::time::Duration::from_millis(5)),
                Err(nb::Error::Other(e)) => panic!("receive failed: {e}"),
            }
        }
        assert_eq!(got, Some(frame));
    }
}
