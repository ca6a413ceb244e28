//! The client-facing node facade.
//!
//! [`Ballast`] owns every moving part of one cluster member: the two
//! RocksDB stores, the Raft context, the apply worker, the per-peer
//! replicators, the primary ticker, and the RPC server. Client commands
//! execute locally when this node leads and are forwarded to the leader
//! otherwise.

use crate::config::Options;
use crate::error::{BallastError, Result};
use crate::raft::{
    open_log_db, spawn_peers, Apply, Context, LogEntry, LogStore, MetaStore, OpType, PeerSet,
    Primary,
};
use crate::rpc::{
    ClientPool, Request, Response, RpcServer, ServerStatus, Service, StatusCode,
};
use crate::store::KvStore;
use crate::types::{Endpoint, LogIndex, Term};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How long one apply wait lasts before the command reports Timeout.
const APPLY_WAIT_MS: u64 = 1000;

/// A running Ballast node.
pub struct Ballast {
    inner: Arc<NodeInner>,
    server: RpcServer,
    peer_handles: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl Ballast {
    /// Open the stores, recover Raft state, and start every worker.
    /// Failing to open either store is fatal.
    pub fn open(options: Options) -> Result<Self> {
        options.validate()?;
        std::fs::create_dir_all(&options.path)?;

        let db = Arc::new(KvStore::open(options.path.join("db"))?);
        let log_db = open_log_db(options.path.join("log"))?;
        let log = Arc::new(LogStore::new(Arc::clone(&log_db))?);
        let meta = Arc::new(MetaStore::new(log_db));

        let context = Arc::new(Context::new());
        context.recover_init(&meta)?;

        let pool = Arc::new(ClientPool::new(Duration::from_millis(options.rpc_timeout_ms)));
        let apply = Arc::new(Apply::start(
            Arc::clone(&context),
            Arc::clone(&db),
            Arc::clone(&log),
        )?);

        let (peers, peer_handles) = spawn_peers(
            &options,
            Arc::clone(&context),
            Arc::clone(&log),
            Arc::clone(&meta),
            Arc::clone(&pool),
            Arc::clone(&apply),
        )?;

        let primary = Primary::start(
            &options,
            Arc::clone(&context),
            Arc::clone(&peers),
            Arc::clone(&log),
            Arc::clone(&meta),
            Arc::clone(&apply),
        )?;

        // Seed the vote ledger from the persisted vote so a restart
        // cannot hand out a second vote in the recovered term.
        let mut ledger = HashMap::new();
        {
            let state = context.state();
            if let Some(voted_for) = state.voted_for.clone() {
                ledger.insert(state.current_term, voted_for);
            }
        }

        let local = options.local_endpoint();
        let listen = local.to_string();
        let rpc_workers = options.rpc_workers;
        let inner = Arc::new(NodeInner {
            options,
            local,
            db,
            log,
            meta,
            context,
            pool,
            apply,
            peers,
            primary,
            vote_ledger: Mutex::new(ledger),
        });

        let server = RpcServer::start(
            &listen,
            rpc_workers,
            Arc::clone(&inner) as Arc<dyn Service>,
        )?;

        // Replay anything committed before the restart.
        inner.apply.schedule();

        info!(
            endpoint = %listen,
            members = inner.options.members.len(),
            single_mode = inner.options.single_mode,
            "ballast node started"
        );

        Ok(Self {
            inner,
            server,
            peer_handles: Mutex::new(peer_handles),
            stopped: AtomicBool::new(false),
        })
    }

    /// Replicated write; blocks until the entry applies or times out.
    pub fn write(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let request = Request::Write { key: key.to_vec(), value: value.to_vec() };
        match self.inner.do_command(request)? {
            Response::Kv { code: StatusCode::Ok, .. } => Ok(()),
            Response::Kv { .. } => Err(BallastError::Corruption("write failed".into())),
            _ => Err(BallastError::Internal("unexpected write response".into())),
        }
    }

    /// Linearizable read; replicates a read marker through the log.
    pub fn read(&self, key: &[u8]) -> Result<Vec<u8>> {
        let request = Request::Read { key: key.to_vec() };
        match self.inner.do_command(request)? {
            Response::Kv { code: StatusCode::Ok, value } => Ok(value),
            Response::Kv { code: StatusCode::NotFound, .. } => Err(BallastError::NotFound),
            Response::Kv { .. } => Err(BallastError::Corruption("read failed".into())),
            _ => Err(BallastError::Internal("unexpected read response".into())),
        }
    }

    /// Replicated delete; blocks until the entry applies or times out.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        let request = Request::Delete { key: key.to_vec() };
        match self.inner.do_command(request)? {
            Response::Kv { code: StatusCode::Ok, .. } => Ok(()),
            Response::Kv { .. } => Err(BallastError::Corruption("delete failed".into())),
            _ => Err(BallastError::Internal("unexpected delete response".into())),
        }
    }

    /// Unreplicated write: lands locally first, then fans out to every
    /// other member best-effort. Reports Ok even when peers are down.
    pub fn dirty_write(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.inner.dirty_write(key, value)
    }

    /// Unreplicated read of the local applied state.
    pub fn dirty_read(&self, key: &[u8]) -> Result<Vec<u8>> {
        match self.inner.db.get(key)? {
            Some(value) => Ok(value),
            None => Err(BallastError::NotFound),
        }
    }

    /// Whether this node currently knows a leader.
    pub fn has_leader(&self) -> bool {
        self.inner.context.state().has_leader()
    }

    /// The leader endpoint, when known.
    pub fn leader(&self) -> Option<Endpoint> {
        self.inner.context.state().leader.clone()
    }

    /// This node's Raft status.
    pub fn server_status(&self) -> ServerStatus {
        self.inner.local_status()
    }

    /// Status of every reachable member, this node first.
    pub fn cluster_status(&self) -> Vec<ServerStatus> {
        self.inner.cluster_status()
    }

    /// Stop every worker in dependency order and release the stores.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.primary.stop();
        self.inner.peers.stop();
        for handle in self.peer_handles.lock().drain(..) {
            let _ = handle.join();
        }
        self.inner.apply.stop();
        self.server.stop();
        info!(endpoint = %self.inner.local, "ballast node stopped");
    }
}

impl Drop for Ballast {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct NodeInner {
    options: Options,
    local: Endpoint,
    db: Arc<KvStore>,
    log: Arc<LogStore>,
    meta: Arc<MetaStore>,
    context: Arc<Context>,
    pool: Arc<ClientPool>,
    apply: Arc<Apply>,
    peers: Arc<PeerSet>,
    primary: Primary,
    /// term -> candidate granted our vote in that term.
    vote_ledger: Mutex<HashMap<Term, Endpoint>>,
}

impl NodeInner {
    /// Execute a replicated command here if we lead, else forward it.
    fn do_command(&self, request: Request) -> Result<Response> {
        let leader = self.context.state().leader.clone();
        let Some(leader) = leader else {
            return Err(BallastError::NoLeader);
        };

        if leader == self.local {
            self.execute_command(request)
        } else {
            self.pool.send_and_recv(&leader.to_string(), &request)
        }
    }

    /// Leader-side command path: append, fan out, block on the apply
    /// barrier, then answer. A timed-out entry stays in the log; the
    /// client may retry idempotently.
    fn execute_command(&self, request: Request) -> Result<Response> {
        let (op, key, value) = match request {
            Request::Write { key, value } => (OpType::Write, key, value),
            Request::Delete { key } => (OpType::Delete, key, Vec::new()),
            Request::Read { key } => (OpType::Read, key, Vec::new()),
            _ => return Err(BallastError::Internal("not a replicated command".into())),
        };

        let term = self.context.state().current_term;
        let entry = LogEntry::new(term, op, key.clone(), value);
        let appended = self.log.append(vec![entry])?;
        self.primary.notify_new_command();

        if !self.context.wait_applied(appended, Duration::from_millis(APPLY_WAIT_MS)) {
            warn!(index = appended, "apply wait timed out");
            return Err(BallastError::Timeout(APPLY_WAIT_MS));
        }

        match op {
            OpType::Write | OpType::Delete => Ok(Response::kv_code(StatusCode::Ok)),
            OpType::Read => match self.db.get(&key) {
                Ok(Some(value)) => Ok(Response::kv(StatusCode::Ok, value)),
                Ok(None) => Ok(Response::kv_code(StatusCode::NotFound)),
                Err(e) => {
                    warn!(error = %e, "read from kv store failed");
                    Ok(Response::kv_code(StatusCode::Error))
                }
            },
        }
    }

    fn dirty_write(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.db.put(key, value)?;

        let request = Request::DirtyWrite { key: key.to_vec(), value: value.to_vec() };
        for member in self.options.remote_members() {
            if let Err(e) = self.pool.send_and_recv(&member, &request) {
                debug!(member = %member, error = %e, "dirty write fan-out failed");
            }
        }
        Ok(())
    }

    fn local_status(&self) -> ServerStatus {
        let state = self.context.state();
        let (last_log_term, last_log_index) = self.log.last_term_and_index();
        ServerStatus {
            endpoint: self.local.to_string(),
            role: state.role.to_string(),
            term: state.current_term,
            commit_index: self.context.commit_index(),
            leader: state.leader.as_ref().map(|e| e.to_string()),
            voted_for: state.voted_for.as_ref().map(|e| e.to_string()),
            last_log_term,
            last_log_index,
            last_applied: self.context.last_applied(),
        }
    }

    fn cluster_status(&self) -> Vec<ServerStatus> {
        let mut statuses = vec![self.local_status()];
        for member in self.options.remote_members() {
            match self.pool.send_and_recv(&member, &Request::ServerStatus) {
                Ok(Response::ServerStatus(status)) => statuses.push(status),
                Ok(other) => warn!(member = %member, response = ?other, "unexpected status response"),
                Err(e) => debug!(member = %member, error = %e, "status probe failed"),
            }
        }
        statuses
    }

    /// Vote handler. Held under the commit mutex for its whole run.
    fn reply_request_vote(
        &self,
        term: Term,
        candidate: Endpoint,
        last_log_term: Term,
        last_log_index: LogIndex,
    ) -> Response {
        let mut state = self.context.state();

        if term < state.current_term {
            debug!(candidate = %candidate, term, current = state.current_term, "vote denied: stale term");
            return Response::RequestVote { term: state.current_term, vote_granted: false };
        }

        let (my_last_term, my_last_index) = self.log.last_term_and_index();
        let up_to_date = last_log_term > my_last_term
            || (last_log_term == my_last_term && last_log_index >= my_last_index);
        if !up_to_date {
            debug!(
                candidate = %candidate,
                term,
                candidate_log = ?(last_log_term, last_log_index),
                my_log = ?(my_last_term, my_last_index),
                "vote denied: candidate log behind"
            );
            return Response::RequestVote { term: state.current_term, vote_granted: false };
        }

        // One vote per term: the ledger survives term bumps, and the
        // in-memory vote covers our own candidacy in the current term.
        if term == state.current_term
            && state.voted_for.as_ref().is_some_and(|v| *v != candidate)
        {
            debug!(candidate = %candidate, term, "vote denied: already voted this term");
            return Response::RequestVote { term: state.current_term, vote_granted: false };
        }
        if self.vote_ledger.lock().get(&term).is_some_and(|prior| *prior != candidate) {
            debug!(candidate = %candidate, term, "vote denied: ledger holds another candidate");
            return Response::RequestVote { term: state.current_term, vote_granted: false };
        }

        // Durable before the grant leaves this node.
        if let Err(e) = self.meta.persist_term_and_vote(term, Some(&candidate)) {
            error!(error = %e, "failed to persist vote, denying");
            return Response::RequestVote { term: state.current_term, vote_granted: false };
        }

        self.vote_ledger.lock().insert(term, candidate.clone());
        state.become_follower(term, None);
        state.grant_vote(term, candidate.clone());
        state.touch();
        debug!(candidate = %candidate, term, "vote granted");
        Response::RequestVote { term: state.current_term, vote_granted: true }
    }

    /// Replication handler. Held under the commit mutex for its whole
    /// run.
    fn reply_append_entries(
        &self,
        term: Term,
        leader: Endpoint,
        prev_log_index: LogIndex,
        prev_log_term: Term,
        entries: Vec<LogEntry>,
        leader_commit: LogIndex,
    ) -> Response {
        let mut state = self.context.state();
        let last_log_index = self.log.last_index();

        if term < state.current_term {
            debug!(leader = %leader, term, current = state.current_term, "append denied: stale term");
            return Response::AppendEntries {
                term: state.current_term,
                success: false,
                last_log_index,
            };
        }

        if term > state.current_term {
            state.become_follower(term, Some(leader.clone()));
            if let Err(e) = self.meta.persist_term_and_vote(term, None) {
                error!(error = %e, "failed to persist term");
                return Response::AppendEntries {
                    term: state.current_term,
                    success: false,
                    last_log_index,
                };
            }
        } else if !state.role.is_leader() {
            state.observe_leader(leader.clone());
        }
        // Contact from a live leader, even during log repair.
        state.touch();

        if prev_log_index > last_log_index {
            debug!(
                prev_log_index,
                last_log_index,
                "append denied: leader is ahead of our log"
            );
            return Response::AppendEntries {
                term: state.current_term,
                success: false,
                last_log_index,
            };
        }

        let my_prev_term = if prev_log_index == 0 {
            0
        } else {
            match self.log.entry(prev_log_index) {
                Ok(Some(entry)) => entry.term,
                Ok(None) => {
                    warn!(prev_log_index, "log entry missing below our tail");
                    return Response::AppendEntries {
                        term: state.current_term,
                        success: false,
                        last_log_index,
                    };
                }
                Err(e) => {
                    error!(error = %e, prev_log_index, "failed to read prev entry");
                    return Response::AppendEntries {
                        term: state.current_term,
                        success: false,
                        last_log_index,
                    };
                }
            }
        };

        if my_prev_term != prev_log_term {
            warn!(
                prev_log_index,
                prev_log_term,
                my_prev_term,
                "log conflict at prev index, truncating suffix"
            );
            if let Err(e) = self.log.truncate_suffix(prev_log_index) {
                error!(error = %e, "failed to truncate conflicting suffix");
            }
            return Response::AppendEntries {
                term: state.current_term,
                success: false,
                last_log_index: self.log.last_index(),
            };
        }

        // Skip entries we already hold; truncate at the first conflict.
        // A stale or reordered request must never clobber a newer
        // matching suffix.
        let mut fresh = Vec::with_capacity(entries.len());
        let mut index = prev_log_index;
        for entry in entries {
            index += 1;
            if fresh.is_empty() && index <= self.log.last_index() {
                match self.log.entry(index) {
                    Ok(Some(existing)) if existing.term == entry.term => continue,
                    Ok(_) => {
                        warn!(index, "conflicting entry, truncating from here");
                        if let Err(e) = self.log.truncate_suffix(index) {
                            error!(error = %e, "failed to truncate conflicting entries");
                            return Response::AppendEntries {
                                term: state.current_term,
                                success: false,
                                last_log_index: self.log.last_index(),
                            };
                        }
                        fresh.push(entry);
                    }
                    Err(e) => {
                        error!(error = %e, index, "failed to read entry for conflict check");
                        return Response::AppendEntries {
                            term: state.current_term,
                            success: false,
                            last_log_index: self.log.last_index(),
                        };
                    }
                }
            } else {
                fresh.push(entry);
            }
        }

        if !fresh.is_empty() {
            if let Err(e) = self.log.append(fresh) {
                error!(error = %e, "failed to append replicated entries");
                return Response::AppendEntries {
                    term: state.current_term,
                    success: false,
                    last_log_index: self.log.last_index(),
                };
            }
        }

        let new_last = self.log.last_index();
        let new_commit = leader_commit.min(new_last);
        match self.context.advance_commit_index(new_commit, &self.meta) {
            Ok(true) => self.apply.schedule(),
            Ok(false) => {}
            Err(e) => error!(error = %e, "failed to persist commit index"),
        }

        Response::AppendEntries {
            term: state.current_term,
            success: true,
            last_log_index: new_last,
        }
    }
}

impl Service for NodeInner {
    fn call(&self, request: Request) -> Response {
        match request {
            Request::RequestVote { term, ip, port, last_log_term, last_log_index } => {
                self.reply_request_vote(term, Endpoint::new(ip, port), last_log_term, last_log_index)
            }
            Request::AppendEntries {
                term,
                ip,
                port,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            } => self.reply_append_entries(
                term,
                Endpoint::new(ip, port),
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            ),
            Request::DirtyWrite { key, value } => match self.db.put(&key, &value) {
                Ok(()) => Response::kv_code(StatusCode::Ok),
                Err(e) => {
                    warn!(error = %e, "dirty write failed");
                    Response::kv_code(StatusCode::Error)
                }
            },
            Request::ServerStatus => Response::ServerStatus(self.local_status()),
            request @ (Request::Read { .. } | Request::Write { .. } | Request::Delete { .. }) => {
                match self.do_command(request) {
                    Ok(response) => response,
                    Err(e) => {
                        debug!(error = %e, "forwarded command failed");
                        Response::kv_code(StatusCode::Error)
                    }
                }
            }
        }
    }
}
