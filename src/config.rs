//! Engine configuration: local identity, protocol timers and table limits.
//!
//! Every field defaults to the value flight builds use, so an empty JSON
//! object is a valid configuration.

use crate::peer::PeerName;
use crate::wire::CpuId;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_ANNOUNCE_TIMEOUT: u64 = 10;
pub const DEFAULT_HEARTBEAT_SENDTIME: u64 = 5;
pub const DEFAULT_HEARTBEAT_TIMEOUT: u64 = 10;
pub const DEFAULT_MAIN_LOOP_DELAY_MS: u64 = 200;
pub const DEFAULT_MAX_PEERS: usize = 16;
pub const DEFAULT_MAX_SUBS_PER_PEER: usize = 256;
pub const DEFAULT_MAX_MSG_PER_WAKEUP: usize = 32;
pub const DEFAULT_MAX_MSGS_PER_HOST_POLL: usize = 100;
pub const DEFAULT_PEER_PIPE_DEPTH: usize = 64;
pub const DEFAULT_MSG_LIMIT: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub cpu_id: CpuId,
    pub cpu_name: String,
    pub spacecraft_id: u32,

    /// Seconds between ANNOUNCEs to a peer that has not answered yet.
    pub announce_timeout: u64,
    /// Seconds of outbound silence before a HEARTBEAT is sent.
    pub heartbeat_sendtime: u64,
    /// Seconds of inbound silence before a peer is considered lost.
    pub heartbeat_timeout: u64,
    pub main_loop_delay_ms: u64,

    pub max_peers: usize,
    pub max_subs_per_peer: usize,
    pub max_msg_per_wakeup: usize,
    pub max_msgs_per_host_poll: usize,
    pub peer_pipe_depth: usize,
    /// How many messages of one id may wait on a peer pipe.
    pub msg_limit: usize,

    pub volatile_peer_file: Option<PathBuf>,
    pub nonvolatile_peer_file: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cpu_id: 1,
            cpu_name: "CPU1".to_string(),
            spacecraft_id: 0x42,
            announce_timeout: DEFAULT_ANNOUNCE_TIMEOUT,
            heartbeat_sendtime: DEFAULT_HEARTBEAT_SENDTIME,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            main_loop_delay_ms: DEFAULT_MAIN_LOOP_DELAY_MS,
            max_peers: DEFAULT_MAX_PEERS,
            max_subs_per_peer: DEFAULT_MAX_SUBS_PER_PEER,
            max_msg_per_wakeup: DEFAULT_MAX_MSG_PER_WAKEUP,
            max_msgs_per_host_poll: DEFAULT_MAX_MSGS_PER_HOST_POLL,
            peer_pipe_depth: DEFAULT_PEER_PIPE_DEPTH,
            msg_limit: DEFAULT_MSG_LIMIT,
            volatile_peer_file: Some(PathBuf::from("/ram/apps/SbnPeerData.dat")),
            nonvolatile_peer_file: Some(PathBuf::from("/cf/apps/SbnPeerData.dat")),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("cpu name {0:?} is empty or longer than 8 characters")]
    CpuName(String),
    #[error("heartbeat send time ({sendtime}s) must be shorter than the heartbeat timeout ({timeout}s)")]
    HeartbeatTimers { sendtime: u64, timeout: u64 },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

impl EngineConfig {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cpu_name.is_empty() || PeerName::from(&self.cpu_name).is_err() {
            return Err(ConfigError::CpuName(self.cpu_name.clone()));
        }
        if self.heartbeat_sendtime >= self.heartbeat_timeout {
            return Err(ConfigError::HeartbeatTimers {
                sendtime: self.heartbeat_sendtime,
                timeout: self.heartbeat_timeout,
            });
        }
        let limits = [
            ("announce_timeout", self.announce_timeout as usize),
            ("main_loop_delay_ms", self.main_loop_delay_ms as usize),
            ("max_peers", self.max_peers),
            ("max_subs_per_peer", self.max_subs_per_peer),
            ("max_msg_per_wakeup", self.max_msg_per_wakeup),
            ("max_msgs_per_host_poll", self.max_msgs_per_host_poll),
            ("peer_pipe_depth", self.peer_pipe_depth),
            ("msg_limit", self.msg_limit),
        ];
        for (name, value) in limits {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        Ok(())
    }

    /// Peer file candidates in load order: volatile first.
    pub fn peer_file_candidates(&self) -> Vec<&Path> {
        [&self.volatile_peer_file, &self.nonvolatile_peer_file]
            .into_iter()
            .filter_map(|p| p.as_deref())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_yields_defaults() {
        let config = EngineConfig::from_json("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.max_subs_per_peer, 256);
        assert_eq!(config.heartbeat_timeout, 10);
    }

    #[test]
    fn partial_override() {
        let config = EngineConfig::from_json(r#"{"cpu_id": 3, "cpu_name": "CPU3", "heartbeat_timeout": 20}"#).unwrap();
        assert_eq!(config.cpu_id, 3);
        assert_eq!(config.heartbeat_timeout, 20);
        assert_eq!(config.announce_timeout, DEFAULT_ANNOUNCE_TIMEOUT);
    }

    #[test]
    fn rejects_inverted_heartbeat_timers() {
        let err = EngineConfig::from_json(r#"{"heartbeat_sendtime": 10, "heartbeat_timeout": 10}"#).unwrap_err();
        assert!(matches!(err, ConfigError::HeartbeatTimers { .. }));
    }

    #[test]
    fn rejects_zero_limits() {
        let err = EngineConfig::from_json(r#"{"max_peers": 0}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Zero("max_peers")));
    }

    #[test]
    fn rejects_long_cpu_name() {
        let err = EngineConfig::from_json(r#"{"cpu_name": "WAYTOOLONG"}"#).unwrap_err();
        assert!(matches!(err, ConfigError::CpuName(_)));
    }

    #[test]
    fn peer_file_order_is_volatile_first() {
        let config = EngineConfig::default();
        let candidates = config.peer_file_candidates();
        assert_eq!(candidates.len(), 2);
        assert!(candidates[0].starts_with("/ram"));
    }
}
