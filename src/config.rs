//! Node configuration.

use crate::error::{BallastError, Result};
use crate::types::Endpoint;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Configuration for a single Ballast node.
///
/// `members` is the full, ordered cluster membership (including this
/// node); the cluster size and majority are derived from it and fixed
/// for the process lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Options {
    /// This node's RPC listen address.
    pub local_ip: String,
    /// This node's RPC listen port.
    pub local_port: u16,
    /// All cluster members as "ip:port" strings, including this node.
    pub members: Vec<String>,
    /// Directory holding the KV store (`db/`) and the log store (`log/`).
    pub path: PathBuf,
    /// Leader heartbeat period in microseconds.
    #[serde(default = "default_heartbeat_us")]
    pub heartbeat_us: u64,
    /// Follower election timeout in microseconds; also the staleness
    /// bound after which a follower suspects the leader is gone.
    #[serde(default = "default_check_leader_us")]
    pub check_leader_us: u64,
    /// Skip elections and self-promote; only valid for a 1-node cluster.
    #[serde(default)]
    pub single_mode: bool,
    /// Maximum log entries shipped per AppendEntries RPC.
    #[serde(default = "default_append_batch")]
    pub append_batch: usize,
    /// Per-RPC connect/read/write timeout in milliseconds.
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
    /// Size of the inbound RPC worker pool.
    #[serde(default = "default_rpc_workers")]
    pub rpc_workers: usize,
    /// Log level used when RUST_LOG is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Emit JSON-formatted logs.
    #[serde(default)]
    pub json_logs: bool,
}

fn default_heartbeat_us() -> u64 {
    100_000
}

fn default_check_leader_us() -> u64 {
    1_000_000
}

fn default_append_batch() -> usize {
    100
}

fn default_rpc_timeout_ms() -> u64 {
    1_000
}

fn default_rpc_workers() -> usize {
    8
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Options {
    fn default() -> Self {
        Self {
            local_ip: "127.0.0.1".to_string(),
            local_port: 8901,
            members: vec!["127.0.0.1:8901".to_string()],
            path: PathBuf::from("./ballast-data"),
            heartbeat_us: default_heartbeat_us(),
            check_leader_us: default_check_leader_us(),
            single_mode: false,
            append_batch: default_append_batch(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
            rpc_workers: default_rpc_workers(),
            log_level: default_log_level(),
            json_logs: false,
        }
    }
}

impl Options {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| BallastError::Config(format!("failed to read config file: {}", e)))?;

        let options: Self = serde_json::from_str(&content)
            .map_err(|e| BallastError::Config(format!("failed to parse config: {}", e)))?;

        options.validate()?;
        Ok(options)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.members.is_empty() {
            return Err(BallastError::InvalidConfig {
                field: "members".to_string(),
                reason: "member list cannot be empty".to_string(),
            });
        }

        let local = self.local_endpoint().to_string();
        if !self.members.iter().any(|m| *m == local) {
            return Err(BallastError::InvalidConfig {
                field: "members".to_string(),
                reason: format!("member list must include the local endpoint {}", local),
            });
        }

        for member in &self.members {
            member.parse::<Endpoint>().map_err(|_| BallastError::InvalidConfig {
                field: "members".to_string(),
                reason: format!("invalid member endpoint: {}", member),
            })?;
        }

        if self.single_mode && self.members.len() > 1 {
            return Err(BallastError::InvalidConfig {
                field: "single_mode".to_string(),
                reason: "single_mode requires a 1-node member list".to_string(),
            });
        }

        if self.heartbeat_us == 0 || self.check_leader_us <= self.heartbeat_us {
            return Err(BallastError::InvalidConfig {
                field: "check_leader_us".to_string(),
                reason: "election timeout must exceed the heartbeat period".to_string(),
            });
        }

        if self.append_batch == 0 {
            return Err(BallastError::InvalidConfig {
                field: "append_batch".to_string(),
                reason: "append batch must be non-zero".to_string(),
            });
        }

        if self.rpc_workers == 0 {
            return Err(BallastError::InvalidConfig {
                field: "rpc_workers".to_string(),
                reason: "worker pool must be non-empty".to_string(),
            });
        }

        Ok(())
    }

    /// This node's endpoint.
    pub fn local_endpoint(&self) -> Endpoint {
        Endpoint::new(self.local_ip.clone(), self.local_port)
    }

    /// All members except this node.
    pub fn remote_members(&self) -> Vec<String> {
        let local = self.local_endpoint().to_string();
        self.members.iter().filter(|m| **m != local).cloned().collect()
    }
}
