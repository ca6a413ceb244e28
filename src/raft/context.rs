//! Volatile Raft state and role transitions.

use crate::error::Result;
use crate::raft::meta::MetaStore;
use crate::types::{Endpoint, LogIndex, Term};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::info;

/// The role of a node in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Passive; responds to RPCs.
    Follower,
    /// Actively seeking election.
    Candidate,
    /// Handling client commands and replication.
    Leader,
}

impl Role {
    pub fn is_leader(&self) -> bool {
        matches!(self, Role::Leader)
    }

    pub fn is_follower(&self) -> bool {
        matches!(self, Role::Follower)
    }

    pub fn is_candidate(&self) -> bool {
        matches!(self, Role::Candidate)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Follower => write!(f, "follower"),
            Role::Candidate => write!(f, "candidate"),
            Role::Leader => write!(f, "leader"),
        }
    }
}

/// Volatile state guarded by the commit mutex.
#[derive(Debug)]
pub struct RaftState {
    pub role: Role,
    pub current_term: Term,
    pub leader: Option<Endpoint>,
    pub voted_for: Option<Endpoint>,
    /// Votes received in the current candidacy, counting our own.
    pub vote_quorum: u32,
    /// Last time we heard from a live leader or granted a vote.
    pub last_op_time: Instant,
}

impl RaftState {
    fn new() -> Self {
        Self {
            role: Role::Follower,
            current_term: 0,
            leader: None,
            voted_for: None,
            vote_quorum: 0,
            last_op_time: Instant::now(),
        }
    }

    pub fn become_follower(&mut self, term: Term, leader: Option<Endpoint>) {
        self.current_term = term;
        self.voted_for = None;
        self.leader = leader;
        self.role = Role::Follower;
        info!(term, leader = ?self.leader.as_ref().map(|e| e.to_string()), "became follower");
    }

    pub fn become_candidate(&mut self, local: &Endpoint) {
        self.current_term += 1;
        self.role = Role::Candidate;
        self.leader = None;
        self.voted_for = Some(local.clone());
        self.vote_quorum = 1;
        info!(term = self.current_term, "became candidate");
    }

    /// The caller is responsible for resetting the peer counters and
    /// priming heartbeats.
    pub fn become_leader(&mut self, local: &Endpoint) {
        self.role = Role::Leader;
        self.leader = Some(local.clone());
        info!(term = self.current_term, "became leader");
    }

    pub fn grant_vote(&mut self, term: Term, candidate: Endpoint) {
        self.voted_for = Some(candidate);
        self.current_term = term;
    }

    /// Adopt `leader` at our current term without touching voted_for.
    /// Clearing the vote here would permit a second grant in the same
    /// term.
    pub fn observe_leader(&mut self, leader: Endpoint) {
        self.role = Role::Follower;
        self.leader = Some(leader);
    }

    pub fn has_leader(&self) -> bool {
        self.leader.is_some()
    }

    pub fn touch(&mut self) {
        self.last_op_time = Instant::now();
    }
}

/// Per-node Raft state: the volatile core under the commit mutex, the
/// commit-index cell, and the apply cell with its condvar.
///
/// Lock order: commit mutex, then commit-index mutex, then apply mutex.
pub struct Context {
    state: Mutex<RaftState>,
    commit_index: Mutex<LogIndex>,
    last_applied: Mutex<LogIndex>,
    apply_cond: Condvar,
}

impl Context {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RaftState::new()),
            commit_index: Mutex::new(0),
            last_applied: Mutex::new(0),
            apply_cond: Condvar::new(),
        }
    }

    /// Load the persisted term, vote, and commit index; role starts as
    /// Follower.
    pub fn recover_init(&self, meta: &MetaStore) -> Result<()> {
        let mut state = self.state.lock();
        state.current_term = meta.current_term()?;
        let ip = meta.voted_for_ip()?;
        let port = meta.voted_for_port()?;
        state.voted_for = if ip.is_empty() || port == 0 {
            None
        } else {
            Some(Endpoint::new(ip, port))
        };
        state.role = Role::Follower;
        state.leader = None;
        state.last_op_time = Instant::now();

        *self.commit_index.lock() = meta.commit_index()?;
        Ok(())
    }

    /// Lock the volatile core. This is the commit mutex of the lock
    /// order; hold it for short critical sections only and never across
    /// RPC I/O.
    pub fn state(&self) -> MutexGuard<'_, RaftState> {
        self.state.lock()
    }

    pub fn commit_index(&self) -> LogIndex {
        *self.commit_index.lock()
    }

    /// Move the commit index forward and persist it; backward moves are
    /// ignored. Returns whether the index advanced.
    pub fn advance_commit_index(&self, new: LogIndex, meta: &MetaStore) -> Result<bool> {
        let mut commit = self.commit_index.lock();
        if new <= *commit {
            return Ok(false);
        }
        meta.set_commit_index(new)?;
        *commit = new;
        Ok(true)
    }

    pub fn last_applied(&self) -> LogIndex {
        *self.last_applied.lock()
    }

    /// Record that the entry at `index` has been applied and wake any
    /// command waiting on it.
    pub fn bump_applied(&self, index: LogIndex) {
        let mut applied = self.last_applied.lock();
        if index > *applied {
            *applied = index;
        }
        self.apply_cond.notify_all();
    }

    /// Block until `last_applied >= target`. Waits are bounded by
    /// `wait`; returns false if a full wait elapses with no progress.
    /// Spurious wakeups are fine since the predicate is re-checked.
    pub fn wait_applied(&self, target: LogIndex, wait: Duration) -> bool {
        let mut applied = self.last_applied.lock();
        while *applied < target {
            let before = *applied;
            let result = self.apply_cond.wait_for(&mut applied, wait);
            if result.timed_out() && *applied == before {
                return false;
            }
        }
        true
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}
