//! Event classes attached to every log record as the `eid` field.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventId {
    Init,
    File,
    Peer,
    Sub,
    Msg,
    Proto,
    Cmd,
    Hk,
    Sb,
    Transport,
}

impl EventId {
    /// Numeric event id, stable across releases so ground tools can filter on it.
    pub fn code(self) -> u16 {
        match self {
            EventId::Init => 1,
            EventId::File => 2,
            EventId::Peer => 3,
            EventId::Sub => 4,
            EventId::Msg => 5,
            EventId::Proto => 6,
            EventId::Cmd => 7,
            EventId::Hk => 8,
            EventId::Sb => 9,
            EventId::Transport => 10,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventId::Init => "init",
            EventId::File => "file",
            EventId::Peer => "peer",
            EventId::Sub => "sub",
            EventId::Msg => "msg",
            EventId::Proto => "proto",
            EventId::Cmd => "cmd",
            EventId::Hk => "hk",
            EventId::Sb => "sb",
            EventId::Transport => "transport",
        }
    }
}

impl core::fmt::Display for EventId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}
