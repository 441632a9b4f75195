//! SBN wire format.
//!
//! Every frame exchanged between peers, on every link technology, is a fixed
//! 7-byte header followed by `msg_size` payload bytes:
//!
//! ```text
//! +----------------+-------------+------------------+-----------------+
//! | msg_size (u16) | type (u8)   | sender cpu (u32) | payload ...     |
//! +----------------+-------------+------------------+-----------------+
//! ```
//!
//! All integers are big-endian. Subscription payloads are
//! `msg_id (u16) | priority (u8) | reliability (u8)`.

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;
use thiserror::Error;

/// Largest frame (header included) any transport will carry.
pub const MAX_MSG_SIZE: usize = 1400;
pub const HEADER_SIZE: usize = 2 + 1 + 4;
pub const SUB_PAYLOAD_SIZE: usize = 2 + 1 + 1;
pub const MAX_PAYLOAD_SIZE: usize = MAX_MSG_SIZE - HEADER_SIZE;

const_assert!(HEADER_SIZE == 7);
const_assert!(MAX_PAYLOAD_SIZE <= u16::MAX as usize);

/// Bus message identifier.
pub type MsgId = u16;
/// Processor id of the sending CPU.
pub type CpuId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MsgType {
    Announce,
    AnnounceAck,
    Heartbeat,
    HeartbeatAck,
    Subscribe,
    Unsubscribe,
    AppMsg,
    CommandAck,
    CommandNack,
}

impl MsgType {
    pub fn code(self) -> u8 {
        match self {
            MsgType::Announce => 0x10,
            MsgType::AnnounceAck => 0x11,
            MsgType::Heartbeat => 0x20,
            MsgType::HeartbeatAck => 0x21,
            MsgType::Subscribe => 0x30,
            MsgType::Unsubscribe => 0x31,
            MsgType::AppMsg => 0x40,
            MsgType::CommandAck => 0x50,
            MsgType::CommandNack => 0x51,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, WireError> {
        Ok(match code {
            0x10 => MsgType::Announce,
            0x11 => MsgType::AnnounceAck,
            0x20 => MsgType::Heartbeat,
            0x21 => MsgType::HeartbeatAck,
            0x30 => MsgType::Subscribe,
            0x31 => MsgType::Unsubscribe,
            0x40 => MsgType::AppMsg,
            0x50 => MsgType::CommandAck,
            0x51 => MsgType::CommandNack,
            other => return Err(WireError::UnknownMsgType(other)),
        })
    }

    /// Link-maintenance traffic: announces, heartbeats and their acks.
    pub fn is_protocol(self) -> bool {
        matches!(
            self,
            MsgType::Announce | MsgType::AnnounceAck | MsgType::Heartbeat | MsgType::HeartbeatAck
        )
    }

    /// Everything that is not link maintenance.
    pub fn is_data(self) -> bool {
        !self.is_protocol()
    }

    pub fn name(self) -> &'static str {
        match self {
            MsgType::Announce => "Announce",
            MsgType::AnnounceAck => "Announce Ack",
            MsgType::Heartbeat => "Heartbeat",
            MsgType::HeartbeatAck => "Heartbeat Ack",
            MsgType::Subscribe => "Subscribe",
            MsgType::Unsubscribe => "UnSubscribe",
            MsgType::AppMsg => "App Msg",
            MsgType::CommandAck => "Command Ack",
            MsgType::CommandNack => "Command Nack",
        }
    }
}

impl core::fmt::Display for MsgType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

/// Quality-of-service tag carried with every subscription.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Qos {
    pub priority: u8,
    pub reliability: u8,
}

impl Qos {
    pub const fn new(priority: u8, reliability: u8) -> Self {
        Self { priority, reliability }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub msg_size: u16,
    pub msg_type: MsgType,
    pub cpu_id: CpuId,
}

/// A decoded frame: who sent it, what it is, and its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: MsgType,
    pub cpu_id: CpuId,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(msg_type: MsgType, cpu_id: CpuId, payload: Vec<u8>) -> Self {
        Self { msg_type, cpu_id, payload }
    }

    /// A frame without payload (announce, heartbeat, acks).
    pub fn bare(msg_type: MsgType, cpu_id: CpuId) -> Self {
        Self::new(msg_type, cpu_id, Vec::new())
    }

    pub fn header(&self) -> Result<Header, WireError> {
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(WireError::PayloadTooLarge(self.payload.len()));
        }
        Ok(Header {
            msg_size: self.payload.len() as u16,
            msg_type: self.msg_type,
            cpu_id: self.cpu_id,
        })
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut out)?;
        Ok(out)
    }

    pub fn encode_into<B: BufMut>(&self, buf: &mut B) -> Result<(), WireError> {
        let header = self.header()?;
        encode_header(&header, buf);
        buf.put_slice(&self.payload);
        Ok(())
    }

    /// Decodes exactly one frame from `bytes`. Trailing bytes are an error.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let (frame, used) = Self::decode_prefix(bytes)?;
        if used != bytes.len() {
            return Err(WireError::TrailingBytes(bytes.len() - used));
        }
        Ok(frame)
    }

    /// Decodes one frame from the front of `bytes`, returning it together
    /// with the number of bytes consumed.
    pub fn decode_prefix(bytes: &[u8]) -> Result<(Self, usize), WireError> {
        let header = decode_header(bytes)?;
        let total = HEADER_SIZE + usize::from(header.msg_size);
        if bytes.len() < total {
            return Err(WireError::Truncated { needed: total, available: bytes.len() });
        }
        let payload = bytes[HEADER_SIZE..total].to_vec();
        Ok((Self::new(header.msg_type, header.cpu_id, payload), total))
    }
}

pub fn encode_header<B: BufMut>(header: &Header, buf: &mut B) {
    buf.put_u16(header.msg_size);
    buf.put_u8(header.msg_type.code());
    buf.put_u32(header.cpu_id);
}

pub fn decode_header(mut bytes: &[u8]) -> Result<Header, WireError> {
    if bytes.len() < HEADER_SIZE {
        return Err(WireError::Truncated { needed: HEADER_SIZE, available: bytes.len() });
    }
    let msg_size = bytes.get_u16();
    let msg_type = MsgType::from_code(bytes.get_u8())?;
    let cpu_id = bytes.get_u32();
    if usize::from(msg_size) > MAX_PAYLOAD_SIZE {
        return Err(WireError::PayloadTooLarge(usize::from(msg_size)));
    }
    Ok(Header { msg_size, msg_type, cpu_id })
}

pub fn pack_sub(msg_id: MsgId, qos: Qos) -> [u8; SUB_PAYLOAD_SIZE] {
    let mut out = [0u8; SUB_PAYLOAD_SIZE];
    let mut buf = &mut out[..];
    buf.put_u16(msg_id);
    buf.put_u8(qos.priority);
    buf.put_u8(qos.reliability);
    out
}

pub fn unpack_sub(mut bytes: &[u8]) -> Result<(MsgId, Qos), WireError> {
    if bytes.len() < SUB_PAYLOAD_SIZE {
        return Err(WireError::Truncated { needed: SUB_PAYLOAD_SIZE, available: bytes.len() });
    }
    let msg_id = bytes.get_u16();
    let priority = bytes.get_u8();
    let reliability = bytes.get_u8();
    Ok((msg_id, Qos::new(priority, reliability)))
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("frame truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
    #[error("unknown SBN message type 0x{0:02x}")]
    UnknownMsgType(u8),
    #[error("payload of {0} bytes exceeds the SBN maximum")]
    PayloadTooLarge(usize),
    #[error("{0} unexpected trailing bytes after frame")]
    TrailingBytes(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_big_endian() {
        let frame = Frame::new(MsgType::AppMsg, 0x0102_0304, vec![0xAA, 0xBB]);
        let bytes = frame.encode().unwrap();
        assert_eq!(bytes, vec![0x00, 0x02, 0x40, 0x01, 0x02, 0x03, 0x04, 0xAA, 0xBB]);
    }

    #[test]
    fn subscription_tuple_survives_pack_unpack() {
        let packed = pack_sub(0x18A5, Qos::new(3, 1));
        assert_eq!(packed, [0x18, 0xA5, 3, 1]);
        assert_eq!(unpack_sub(&packed).unwrap(), (0x18A5, Qos::new(3, 1)));
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let mut bytes = Frame::new(MsgType::Subscribe, 7, vec![1, 2, 3, 4]).encode().unwrap();
        bytes.truncate(9);
        assert_eq!(
            Frame::decode(&bytes),
            Err(WireError::Truncated { needed: 11, available: 9 })
        );
    }

    #[test]
    fn unknown_type_is_rejected() {
        let bytes = [0x00, 0x00, 0x99, 0, 0, 0, 1];
        assert_eq!(Frame::decode(&bytes), Err(WireError::UnknownMsgType(0x99)));
    }

    #[test]
    fn oversized_payload_cannot_be_encoded() {
        let frame = Frame::new(MsgType::AppMsg, 1, vec![0; MAX_PAYLOAD_SIZE + 1]);
        assert!(matches!(frame.encode(), Err(WireError::PayloadTooLarge(_))));
    }

    #[test]
    fn protocol_and_data_classification() {
        assert!(MsgType::Heartbeat.is_protocol());
        assert!(MsgType::AnnounceAck.is_protocol());
        assert!(MsgType::AppMsg.is_data());
        assert!(MsgType::CommandNack.is_data());
        assert!(!MsgType::Subscribe.is_protocol());
        assert_eq!(MsgType::Unsubscribe.to_string(), "UnSubscribe");
    }

    #[test]
    fn decode_prefix_reports_consumed_length() {
        let mut bytes = Frame::bare(MsgType::Heartbeat, 9).encode().unwrap();
        bytes.extend_from_slice(&[0xFF; 3]);
        let (frame, used) = Frame::decode_prefix(&bytes).unwrap();
        assert_eq!(used, HEADER_SIZE);
        assert_eq!(frame, Frame::bare(MsgType::Heartbeat, 9));
    }
}
