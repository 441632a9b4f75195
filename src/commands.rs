//! Ground commands accepted on `SBN_CMD_MID`.
//!
//! Payload layout: `[command code u8][checksum u8][arguments]`. Every command
//! has a fixed payload length and anything else is rejected before it runs.

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Command code and checksum.
pub const CMD_HEADER_SIZE: usize = 2;
/// Peer index plus one byte of padding.
pub const PEER_ARG_SIZE: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum CommandCode {
    Noop = 0,
    ResetCounters = 1,
    GetPeerList = 2,
    GetPeerStatus = 3,
    ResetPeer = 4,
}

impl CommandCode {
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            0 => Some(CommandCode::Noop),
            1 => Some(CommandCode::ResetCounters),
            2 => Some(CommandCode::GetPeerList),
            3 => Some(CommandCode::GetPeerStatus),
            4 => Some(CommandCode::ResetPeer),
            _ => None,
        }
    }

    /// Exact payload length this command must arrive with.
    pub fn payload_len(self) -> usize {
        match self {
            CommandCode::GetPeerStatus | CommandCode::ResetPeer => CMD_HEADER_SIZE + PEER_ARG_SIZE,
            _ => CMD_HEADER_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroundCommand {
    Noop,
    ResetCounters,
    GetPeerList,
    GetPeerStatus { peer: u8 },
    ResetPeer { peer: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("empty command")]
    Empty,
    #[error("invalid command code {0}")]
    UnknownCode(u8),
    #[error("invalid length for command code {code}: expected {expected}, got {actual}")]
    BadLength { code: u8, expected: usize, actual: usize },
}

impl GroundCommand {
    pub fn code(&self) -> CommandCode {
        match self {
            GroundCommand::Noop => CommandCode::Noop,
            GroundCommand::ResetCounters => CommandCode::ResetCounters,
            GroundCommand::GetPeerList => CommandCode::GetPeerList,
            GroundCommand::GetPeerStatus { .. } => CommandCode::GetPeerStatus,
            GroundCommand::ResetPeer { .. } => CommandCode::ResetPeer,
        }
    }

    pub fn decode(mut payload: &[u8]) -> Result<Self, CommandError> {
        let raw = *payload.first().ok_or(CommandError::Empty)?;
        let code = CommandCode::from_u8(raw).ok_or(CommandError::UnknownCode(raw))?;
        if payload.len() != code.payload_len() {
            return Err(CommandError::BadLength {
                code: raw,
                expected: code.payload_len(),
                actual: payload.len(),
            });
        }
        payload.advance(CMD_HEADER_SIZE);
        Ok(match code {
            CommandCode::Noop => GroundCommand::Noop,
            CommandCode::ResetCounters => GroundCommand::ResetCounters,
            CommandCode::GetPeerList => GroundCommand::GetPeerList,
            CommandCode::GetPeerStatus => GroundCommand::GetPeerStatus { peer: payload.get_u8() },
            CommandCode::ResetPeer => GroundCommand::ResetPeer { peer: payload.get_u8() },
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let code = self.code();
        let mut out = Vec::with_capacity(code.payload_len());
        out.put_u8(code as u8);
        // The checksum is carried but not verified on receipt.
        out.put_u8(0);
        match self {
            GroundCommand::GetPeerStatus { peer } | GroundCommand::ResetPeer { peer } => {
                out.put_u8(*peer);
                out.put_u8(0);
            }
            _ => {}
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_commands_carry_index() {
        let cmd = GroundCommand::decode(&[3, 0, 7, 0]).unwrap();
        assert_eq!(cmd, GroundCommand::GetPeerStatus { peer: 7 });
        assert_eq!(GroundCommand::ResetPeer { peer: 2 }.encode(), vec![4, 0, 2, 0]);
    }

    #[test]
    fn length_must_be_exact() {
        assert_eq!(
            GroundCommand::decode(&[0, 0, 0]),
            Err(CommandError::BadLength { code: 0, expected: 2, actual: 3 })
        );
        assert_eq!(
            GroundCommand::decode(&[4, 0]),
            Err(CommandError::BadLength { code: 4, expected: 4, actual: 2 })
        );
        assert_eq!(GroundCommand::decode(&[]), Err(CommandError::Empty));
        assert_eq!(GroundCommand::decode(&[9, 0]), Err(CommandError::UnknownCode(9)));
    }
}
