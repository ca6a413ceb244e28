//! Raft consensus engine for the Ballast cluster.
//!
//! This module implements leader election, log replication, commitment
//! and application over a fixed member set. The moving parts are a
//! single primary ticker thread (election and heartbeat timers), one
//! replicator worker per remote peer, and one apply worker draining
//! committed entries into the KV store.

// Deny unsafe code patterns in this critical consensus module.
// unwrap() calls can cause panics that break consensus.
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

mod apply;
mod context;
mod log;
mod meta;
mod peer;
mod primary;

pub use apply::Apply;
pub use context::{Context, RaftState, Role};
pub use log::{open_log_db, LogEntry, LogStore, OpType};
pub use meta::MetaStore;
pub use peer::{spawn_peers, PeerSet, PeerState};
pub use primary::Primary;
