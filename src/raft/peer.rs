//! Per-peer replication workers.
//!
//! Each remote member gets one worker thread consuming a FIFO task
//! queue. The primary (and an election winner) enqueue tasks; workers
//! never schedule themselves except to continue a rejected or truncated
//! replication round.

use crate::config::Options;
use crate::error::{BallastError, Result};
use crate::raft::apply::Apply;
use crate::raft::context::{Context, RaftState};
use crate::raft::log::LogStore;
use crate::raft::meta::MetaStore;
use crate::rpc::client::ClientPool;
use crate::rpc::message::{Request, Response};
use crate::types::{Endpoint, LogIndex, Term};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeerTask {
    RequestVote,
    AppendEntries,
    Stop,
}

/// Replication bookkeeping for one remote member.
///
/// The counters are written only by the owning worker and by the
/// election winner's reset; everyone may read them for quorum counting.
pub struct PeerState {
    addr: String,
    next_index: AtomicU64,
    match_index: AtomicU64,
    append_pending: AtomicBool,
    tx: Sender<PeerTask>,
}

impl PeerState {
    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn next_index(&self) -> LogIndex {
        self.next_index.load(Ordering::Acquire)
    }

    pub fn match_index(&self) -> LogIndex {
        self.match_index.load(Ordering::Acquire)
    }

    fn enqueue_request_vote(&self) {
        let _ = self.tx.send(PeerTask::RequestVote);
    }

    /// Enqueue a replication round; redundant enqueues collapse while
    /// one is already waiting in the queue.
    fn enqueue_append_entries(&self) {
        if self
            .append_pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
            && self.tx.send(PeerTask::AppendEntries).is_err()
        {
            self.append_pending.store(false, Ordering::Release);
        }
    }
}

/// The fixed peer set, shared by the primary and every worker.
pub struct PeerSet {
    peers: Vec<Arc<PeerState>>,
    cluster_size: usize,
}

impl PeerSet {
    /// Majority of the full member set, self included.
    pub fn majority(&self) -> usize {
        self.cluster_size / 2 + 1
    }

    pub fn peers(&self) -> &[Arc<PeerState>] {
        &self.peers
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn broadcast_request_vote(&self) {
        for peer in &self.peers {
            peer.enqueue_request_vote();
        }
    }

    pub fn broadcast_append_entries(&self) {
        for peer in &self.peers {
            peer.enqueue_append_entries();
        }
    }

    /// Reset all counters for a fresh leadership.
    pub fn reset_counters(&self, next_index: LogIndex) {
        for peer in &self.peers {
            peer.next_index.store(next_index, Ordering::Release);
            peer.match_index.store(0, Ordering::Release);
        }
    }

    pub fn stop(&self) {
        for peer in &self.peers {
            let _ = peer.tx.send(PeerTask::Stop);
        }
    }
}

/// Build the peer set and spawn one worker per remote member.
#[allow(clippy::type_complexity)]
pub fn spawn_peers(
    options: &Options,
    context: Arc<Context>,
    log: Arc<LogStore>,
    meta: Arc<MetaStore>,
    pool: Arc<ClientPool>,
    apply: Arc<Apply>,
) -> Result<(Arc<PeerSet>, Vec<JoinHandle<()>>)> {
    let mut peers = Vec::new();
    let mut queues: Vec<Receiver<PeerTask>> = Vec::new();

    for addr in options.remote_members() {
        let (tx, rx) = unbounded();
        peers.push(Arc::new(PeerState {
            addr,
            next_index: AtomicU64::new(1),
            match_index: AtomicU64::new(0),
            append_pending: AtomicBool::new(false),
            tx,
        }));
        queues.push(rx);
    }

    let set = Arc::new(PeerSet { peers, cluster_size: options.members.len() });

    let mut handles = Vec::new();
    for (i, rx) in queues.into_iter().enumerate() {
        let worker = PeerWorker {
            me: Arc::clone(&set.peers[i]),
            peers: Arc::clone(&set),
            context: Arc::clone(&context),
            log: Arc::clone(&log),
            meta: Arc::clone(&meta),
            pool: Arc::clone(&pool),
            apply: Arc::clone(&apply),
            local: options.local_endpoint(),
            append_batch: options.append_batch as u64,
        };
        handles.push(
            thread::Builder::new()
                .name(format!("ballast-peer-{}", set.peers[i].addr))
                .spawn(move || worker.run(rx))?,
        );
    }

    Ok((set, handles))
}

struct PeerWorker {
    me: Arc<PeerState>,
    peers: Arc<PeerSet>,
    context: Arc<Context>,
    log: Arc<LogStore>,
    meta: Arc<MetaStore>,
    pool: Arc<ClientPool>,
    apply: Arc<Apply>,
    local: Endpoint,
    append_batch: u64,
}

impl PeerWorker {
    fn run(self, rx: Receiver<PeerTask>) {
        while let Ok(task) = rx.recv() {
            match task {
                PeerTask::RequestVote => self.request_vote(),
                PeerTask::AppendEntries => self.append_entries(),
                PeerTask::Stop => break,
            }
        }
    }

    /// Ask this peer for its vote. Valid only while we are a candidate;
    /// an RPC failure is left for the next election tick.
    fn request_vote(&self) {
        let (term, last_log_term, last_log_index) = {
            let state = self.context.state();
            if !state.role.is_candidate() {
                return;
            }
            let (last_term, last_index) = self.log.last_term_and_index();
            (state.current_term, last_term, last_index)
        };

        let request = Request::RequestVote {
            term,
            ip: self.local.ip.clone(),
            port: self.local.port,
            last_log_term,
            last_log_index,
        };

        let response = match self.pool.send_and_recv(&self.me.addr, &request) {
            Ok(response) => response,
            Err(e) => {
                debug!(peer = %self.me.addr, error = %e, "request vote rpc failed");
                return;
            }
        };

        let (reply_term, vote_granted) = match response {
            Response::RequestVote { term, vote_granted } => (term, vote_granted),
            other => {
                warn!(peer = %self.me.addr, response = ?other, "unexpected request vote response");
                return;
            }
        };

        let mut state = self.context.state();
        if reply_term > state.current_term {
            state.become_follower(reply_term, None);
            self.persist_term(&state);
            return;
        }
        if !state.role.is_candidate() || !vote_granted || reply_term != state.current_term {
            return;
        }

        state.vote_quorum += 1;
        debug!(peer = %self.me.addr, votes = state.vote_quorum, term, "vote granted");

        if state.vote_quorum as usize >= self.peers.majority() {
            state.become_leader(&self.local);
            self.peers.reset_counters(self.log.last_index() + 1);
            drop(state);
            // Announce leadership before the next heartbeat tick.
            self.peers.broadcast_append_entries();
        }
    }

    /// Ship one batch of entries (or a bare heartbeat) to this peer and
    /// fold the reply back into the shared counters.
    fn append_entries(&self) {
        self.me.append_pending.store(false, Ordering::Release);

        let (term, leader_commit) = {
            let state = self.context.state();
            if !state.role.is_leader() {
                return;
            }
            (state.current_term, self.context.commit_index())
        };

        let last_log_index = self.log.last_index();
        let mut next_index = self.me.next_index();
        if next_index > last_log_index + 1 {
            next_index = last_log_index + 1;
            self.me.next_index.store(next_index, Ordering::Release);
        }

        let prev_log_index = next_index - 1;
        let prev_log_term = match self.term_at(prev_log_index) {
            Ok(term) => term,
            Err(e) => {
                warn!(peer = %self.me.addr, error = %e, "failed to read prev log term");
                return;
            }
        };

        let high = last_log_index.min(prev_log_index + self.append_batch);
        let entries = if next_index > high {
            Vec::new()
        } else {
            match self.log.range(next_index, high) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(peer = %self.me.addr, error = %e, "failed to read entries for replication");
                    return;
                }
            }
        };
        let sent = entries.len() as u64;

        let request = Request::AppendEntries {
            term,
            ip: self.local.ip.clone(),
            port: self.local.port,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit,
        };

        let response = match self.pool.send_and_recv(&self.me.addr, &request) {
            Ok(response) => response,
            Err(e) => {
                // Counters stay put; the next heartbeat re-attempts.
                debug!(peer = %self.me.addr, error = %e, "append entries rpc failed");
                return;
            }
        };

        let (reply_term, success, peer_last) = match response {
            Response::AppendEntries { term, success, last_log_index } => {
                (term, success, last_log_index)
            }
            other => {
                warn!(peer = %self.me.addr, response = ?other, "unexpected append entries response");
                return;
            }
        };

        let state = self.context.state();
        if reply_term > state.current_term {
            let mut state = state;
            state.become_follower(reply_term, None);
            self.persist_term(&state);
            return;
        }
        if !state.role.is_leader() || reply_term != state.current_term {
            return;
        }

        if !success {
            let rollback = (peer_last + 1).max(1);
            self.me.next_index.store(rollback, Ordering::Release);
            debug!(
                peer = %self.me.addr,
                next_index = rollback,
                "append entries rejected, rolling back"
            );
            drop(state);
            self.me.enqueue_append_entries();
            return;
        }

        let match_index = prev_log_index + sent;
        self.me.match_index.store(match_index, Ordering::Release);
        self.me.next_index.store(match_index + 1, Ordering::Release);
        self.advance_leader_commit(&state);
        drop(state);

        if match_index < self.log.last_index() {
            // More than one batch behind; keep pumping.
            self.me.enqueue_append_entries();
        }
    }

    /// Advance the commit index to the highest entry of the current
    /// term replicated on a majority, counting ourselves at the tail.
    fn advance_leader_commit(&self, state: &RaftState) {
        let last_index = self.log.last_index();
        let mut indices: Vec<LogIndex> =
            self.peers.peers().iter().map(|p| p.match_index()).collect();
        indices.push(last_index);
        indices.sort_unstable_by(|a, b| b.cmp(a));

        let candidate = indices[self.peers.majority() - 1];
        if candidate == 0 || candidate <= self.context.commit_index() {
            return;
        }

        match self.log.entry(candidate) {
            Ok(Some(entry)) if entry.term == state.current_term => {
                match self.context.advance_commit_index(candidate, &self.meta) {
                    Ok(true) => {
                        debug!(commit_index = candidate, "advanced commit index");
                        self.apply.schedule();
                    }
                    Ok(false) => {}
                    Err(e) => error!(error = %e, "failed to persist commit index"),
                }
            }
            // An older-term entry never commits by counting; it commits
            // implicitly once a current-term entry lands above it.
            Ok(_) => {}
            Err(e) => warn!(error = %e, index = candidate, "failed to read entry for commit check"),
        }
    }

    fn term_at(&self, index: LogIndex) -> Result<Term> {
        if index == 0 {
            return Ok(0);
        }
        match self.log.entry(index)? {
            Some(entry) => Ok(entry.term),
            None => Err(BallastError::Storage(format!("log entry {} missing", index))),
        }
    }

    fn persist_term(&self, state: &RaftState) {
        if let Err(e) = self.meta.persist_term_and_vote(state.current_term, None) {
            error!(error = %e, "failed to persist term");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(addr: &str, next: u64, matched: u64) -> Arc<PeerState> {
        let (tx, _rx) = unbounded();
        Arc::new(PeerState {
            addr: addr.to_string(),
            next_index: AtomicU64::new(next),
            match_index: AtomicU64::new(matched),
            append_pending: AtomicBool::new(false),
            tx,
        })
    }

    #[test]
    fn test_majority() {
        let set = PeerSet { peers: vec![peer("a", 1, 0), peer("b", 1, 0)], cluster_size: 3 };
        assert_eq!(set.majority(), 2);

        let set = PeerSet {
            peers: vec![peer("a", 1, 0), peer("b", 1, 0), peer("c", 1, 0), peer("d", 1, 0)],
            cluster_size: 5,
        };
        assert_eq!(set.majority(), 3);

        let set = PeerSet { peers: Vec::new(), cluster_size: 1 };
        assert_eq!(set.majority(), 1);
        assert!(set.is_empty());
    }

    #[test]
    fn test_reset_counters() {
        let set = PeerSet { peers: vec![peer("a", 3, 7), peer("b", 9, 2)], cluster_size: 3 };
        set.reset_counters(11);
        for p in set.peers() {
            assert_eq!(p.next_index(), 11);
            assert_eq!(p.match_index(), 0);
        }
    }

    #[test]
    fn test_append_enqueue_collapses() {
        let (tx, rx) = unbounded();
        let state = PeerState {
            addr: "a".to_string(),
            next_index: AtomicU64::new(1),
            match_index: AtomicU64::new(0),
            append_pending: AtomicBool::new(false),
            tx,
        };

        state.enqueue_append_entries();
        state.enqueue_append_entries();
        state.enqueue_append_entries();

        assert_eq!(rx.try_recv().unwrap(), PeerTask::AppendEntries);
        assert!(rx.try_recv().is_err());

        // The worker clears the flag when it picks the task up; a new
        // enqueue goes through again.
        state.append_pending.store(false, Ordering::Release);
        state.enqueue_append_entries();
        assert_eq!(rx.try_recv().unwrap(), PeerTask::AppendEntries);
    }
}
