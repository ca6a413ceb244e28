//! Wire messages exchanged between nodes.
//!
//! One request/response pair covers both the client command surface and
//! the Raft RPCs, so a single connection type serves peers, redirected
//! clients, and status probes alike.

use crate::raft::LogEntry;
use crate::types::{LogIndex, Term};
use serde::{Deserialize, Serialize};

/// Outcome of a key-value command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCode {
    Ok,
    NotFound,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Linearizable read; replicates through the log.
    Read {
        #[serde(with = "serde_bytes")]
        key: Vec<u8>,
    },
    Write {
        #[serde(with = "serde_bytes")]
        key: Vec<u8>,
        #[serde(with = "serde_bytes")]
        value: Vec<u8>,
    },
    Delete {
        #[serde(with = "serde_bytes")]
        key: Vec<u8>,
    },
    /// Unreplicated best-effort write applied directly to the local KV.
    DirtyWrite {
        #[serde(with = "serde_bytes")]
        key: Vec<u8>,
        #[serde(with = "serde_bytes")]
        value: Vec<u8>,
    },
    ServerStatus,
    RequestVote {
        term: Term,
        ip: String,
        port: u16,
        last_log_term: Term,
        last_log_index: LogIndex,
    },
    AppendEntries {
        term: Term,
        ip: String,
        port: u16,
        prev_log_index: LogIndex,
        prev_log_term: Term,
        entries: Vec<LogEntry>,
        leader_commit: LogIndex,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Kv {
        code: StatusCode,
        #[serde(with = "serde_bytes")]
        value: Vec<u8>,
    },
    RequestVote {
        term: Term,
        vote_granted: bool,
    },
    AppendEntries {
        term: Term,
        success: bool,
        /// Responder's tail, used by the leader for fast rollback.
        last_log_index: LogIndex,
    },
    ServerStatus(ServerStatus),
}

impl Response {
    pub fn kv(code: StatusCode, value: Vec<u8>) -> Self {
        Response::Kv { code, value }
    }

    pub fn kv_code(code: StatusCode) -> Self {
        Response::Kv { code, value: Vec::new() }
    }
}

/// A point-in-time view of one node's Raft state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerStatus {
    pub endpoint: String,
    pub role: String,
    pub term: Term,
    pub commit_index: LogIndex,
    pub leader: Option<String>,
    pub voted_for: Option<String>,
    pub last_log_term: Term,
    pub last_log_index: LogIndex,
    pub last_applied: LogIndex,
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} role={} term={} commit={} leader={} voted_for={} last_log=({},{}) applied={}",
            self.endpoint,
            self.role,
            self.term,
            self.commit_index,
            self.leader.as_deref().unwrap_or("none"),
            self.voted_for.as_deref().unwrap_or("none"),
            self.last_log_term,
            self.last_log_index,
            self.last_applied,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::OpType;

    #[test]
    fn test_request_vote_roundtrip() {
        let request = Request::RequestVote {
            term: 5,
            ip: "127.0.0.1".to_string(),
            port: 8902,
            last_log_term: 4,
            last_log_index: 100,
        };

        let bytes = bincode::serialize(&request).unwrap();
        let decoded: Request = bincode::deserialize(&bytes).unwrap();

        match decoded {
            Request::RequestVote { term, port, last_log_index, .. } => {
                assert_eq!(term, 5);
                assert_eq!(port, 8902);
                assert_eq!(last_log_index, 100);
            }
            other => panic!("unexpected decode: {:?}", other),
        }
    }

    #[test]
    fn test_append_entries_roundtrip() {
        let request = Request::AppendEntries {
            term: 3,
            ip: "127.0.0.1".to_string(),
            port: 8901,
            prev_log_index: 7,
            prev_log_term: 2,
            entries: vec![LogEntry {
                term: 3,
                index: 8,
                op: OpType::Write,
                key: b"k".to_vec(),
                value: b"v".to_vec(),
            }],
            leader_commit: 7,
        };

        let bytes = bincode::serialize(&request).unwrap();
        let decoded: Request = bincode::deserialize(&bytes).unwrap();

        match decoded {
            Request::AppendEntries { entries, leader_commit, .. } => {
                assert_eq!(entries.len(), 1);
                assert_eq!(entries[0].key, b"k");
                assert_eq!(leader_commit, 7);
            }
            other => panic!("unexpected decode: {:?}", other),
        }
    }

    #[test]
    fn test_kv_response_roundtrip() {
        let response = Response::kv(StatusCode::Ok, b"value".to_vec());
        let bytes = bincode::serialize(&response).unwrap();
        let decoded: Response = bincode::deserialize(&bytes).unwrap();

        match decoded {
            Response::Kv { code, value } => {
                assert_eq!(code, StatusCode::Ok);
                assert_eq!(value, b"value");
            }
            other => panic!("unexpected decode: {:?}", other),
        }
    }
}
