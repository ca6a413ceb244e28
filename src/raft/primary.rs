//! The primary ticker thread.
//!
//! One thread owns every timer: the election-staleness check, the
//! leader heartbeat, and the fan-out for freshly appended commands.
//! Peers never arm timers themselves, so there is exactly one source of
//! election and heartbeat scheduling per node.

use crate::config::Options;
use crate::error::Result;
use crate::raft::apply::Apply;
use crate::raft::context::Context;
use crate::raft::log::LogStore;
use crate::raft::meta::MetaStore;
use crate::raft::peer::PeerSet;
use crate::types::Endpoint;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use rand::Rng;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

enum PrimaryTask {
    NewCommand,
    Stop,
}

pub struct Primary {
    tx: Sender<PrimaryTask>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Primary {
    pub fn start(
        options: &Options,
        context: Arc<Context>,
        peers: Arc<PeerSet>,
        log: Arc<LogStore>,
        meta: Arc<MetaStore>,
        apply: Arc<Apply>,
    ) -> Result<Self> {
        let (tx, rx) = bounded(64);
        let ticker = Ticker {
            context,
            peers,
            log,
            meta,
            apply,
            local: options.local_endpoint(),
            heartbeat: Duration::from_micros(options.heartbeat_us),
            check_leader: Duration::from_micros(options.check_leader_us),
            check_leader_us: options.check_leader_us,
            single_mode: options.single_mode,
        };
        let handle = thread::Builder::new()
            .name("ballast-primary".to_string())
            .spawn(move || ticker.run(rx))?;
        Ok(Self { tx, handle: Mutex::new(Some(handle)) })
    }

    /// Wake the ticker for a freshly appended command. Bursts beyond the
    /// queue bound collapse into the rounds already scheduled.
    pub fn notify_new_command(&self) {
        let _ = self.tx.try_send(PrimaryTask::NewCommand);
    }

    pub fn stop(&self) {
        let _ = self.tx.send(PrimaryTask::Stop);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

struct Ticker {
    context: Arc<Context>,
    peers: Arc<PeerSet>,
    log: Arc<LogStore>,
    meta: Arc<MetaStore>,
    apply: Arc<Apply>,
    local: Endpoint,
    heartbeat: Duration,
    check_leader: Duration,
    check_leader_us: u64,
    single_mode: bool,
}

impl Ticker {
    fn run(self, rx: Receiver<PrimaryTask>) {
        let mut rng = rand::thread_rng();
        let mut next_heartbeat = Instant::now() + self.heartbeat;
        let mut next_check = Instant::now() + self.check_leader;

        loop {
            let deadline = next_heartbeat.min(next_check);
            let wait = deadline.saturating_duration_since(Instant::now());

            match rx.recv_timeout(wait) {
                Ok(PrimaryTask::NewCommand) => {
                    // Collapse a burst of commands into one fan-out.
                    loop {
                        match rx.try_recv() {
                            Ok(PrimaryTask::NewCommand) => continue,
                            Ok(PrimaryTask::Stop) => return,
                            Err(_) => break,
                        }
                    }
                    self.fan_out_new_command();
                }
                Ok(PrimaryTask::Stop) | Err(RecvTimeoutError::Disconnected) => return,
                Err(RecvTimeoutError::Timeout) => {}
            }

            let now = Instant::now();
            if now >= next_heartbeat {
                self.tick_heartbeat();
                next_heartbeat = now + self.heartbeat;
            }
            if now >= next_check {
                self.tick_check_leader(&mut rng);
                next_check = now + self.check_leader;
            }
        }
    }

    fn fan_out_new_command(&self) {
        if !self.context.state().role.is_leader() {
            debug!("new command while not leader, dropping fan-out");
            return;
        }
        if self.peers.is_empty() {
            self.advance_sole_commit();
        } else {
            self.peers.broadcast_append_entries();
        }
    }

    fn tick_heartbeat(&self) {
        if !self.context.state().role.is_leader() {
            return;
        }
        if self.peers.is_empty() {
            self.advance_sole_commit();
        } else {
            self.peers.broadcast_append_entries();
        }
    }

    fn tick_check_leader(&self, rng: &mut impl Rng) {
        let mut state = self.context.state();
        if state.role.is_leader() {
            return;
        }

        if self.single_mode {
            state.become_leader(&self.local);
            return;
        }

        // Randomized staleness bound staves off split votes between
        // peers whose timers fire together.
        let timeout =
            Duration::from_micros(rng.gen_range(self.check_leader_us..self.check_leader_us * 2));
        if state.last_op_time.elapsed() < timeout {
            return;
        }

        state.become_candidate(&self.local);
        let term = state.current_term;
        let voted_for = state.voted_for.clone();
        // The vote must be durable before any RequestVote leaves.
        if let Err(e) = self.meta.persist_term_and_vote(term, voted_for.as_ref()) {
            error!(error = %e, term, "failed to persist candidate state, deferring election");
            return;
        }
        drop(state);
        self.peers.broadcast_request_vote();
    }

    /// With no remote members every appended entry is trivially
    /// majority-replicated; commit straight to the tail.
    fn advance_sole_commit(&self) {
        let state = self.context.state();
        let (last_term, last_index) = self.log.last_term_and_index();
        if last_index == 0 || last_term != state.current_term {
            return;
        }
        match self.context.advance_commit_index(last_index, &self.meta) {
            Ok(true) => self.apply.schedule(),
            Ok(false) => {}
            Err(e) => warn!(error = %e, "failed to persist commit index"),
        }
    }
}
