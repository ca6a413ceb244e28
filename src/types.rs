//! Core type definitions for Ballast.
//!
//! Cluster members are identified by their RPC endpoint (`ip:port`); the
//! member list is fixed at startup, so the endpoint doubles as a stable
//! node identity.

use crate::error::BallastError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Raft term number.
pub type Term = u64;

/// Raft log index.
pub type LogIndex = u64;

/// Network identity of a cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub ip: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self { ip: ip.into(), port }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = BallastError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ip, port) = s
            .rsplit_once(':')
            .ok_or_else(|| BallastError::Config(format!("invalid endpoint: {}", s)))?;
        if ip.is_empty() {
            return Err(BallastError::Config(format!("invalid endpoint: {}", s)));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| BallastError::Config(format!("invalid port in endpoint: {}", s)))?;
        Ok(Self::new(ip, port))
    }
}
