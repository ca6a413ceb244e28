//! Consensus handler tests.
//!
//! These drive one live node's RequestVote and AppendEntries handlers
//! over the real wire, with the other members of its configured cluster
//! absent, so the node stays a follower and every transition is ours to
//! trigger.

use std::time::Duration;

use tempfile::TempDir;

use ballast::raft::{LogEntry, OpType};
use ballast::rpc::{ClientPool, Request, Response, StatusCode};
use ballast::{Ballast, Options};

// =============================================================================
// Harness
// =============================================================================

struct Harness {
    node: Ballast,
    addr: String,
    pool: ClientPool,
    /// Keeps the node's storage directory alive.
    _dir: TempDir,
    options: Options,
}

impl Harness {
    /// One live node in a 3-member cluster whose peers never answer.
    /// The election timeout is far out so the node stays a follower.
    fn follower(port: u16) -> Self {
        let dir = TempDir::new().unwrap();
        let options = Options {
            local_ip: "127.0.0.1".to_string(),
            local_port: port,
            members: vec![
                format!("127.0.0.1:{}", port),
                format!("127.0.0.1:{}", port + 1),
                format!("127.0.0.1:{}", port + 2),
            ],
            path: dir.path().to_path_buf(),
            heartbeat_us: 50_000,
            check_leader_us: 600_000_000,
            ..Options::default()
        };
        let node = Ballast::open(options.clone()).unwrap();
        Self {
            node,
            addr: format!("127.0.0.1:{}", port),
            pool: ClientPool::new(Duration::from_millis(1000)),
            _dir: dir,
            options,
        }
    }

    /// Restart the node on the same directory.
    fn restart(self) -> Self {
        let Harness { node, addr, pool, _dir, options } = self;
        node.shutdown();
        drop(node);
        let node = Ballast::open(options.clone()).unwrap();
        Harness { node, addr, pool, _dir, options }
    }

    fn request_vote(&self, term: u64, port: u16, last_log_term: u64, last_log_index: u64) -> (u64, bool) {
        let request = Request::RequestVote {
            term,
            ip: "127.0.0.1".to_string(),
            port,
            last_log_term,
            last_log_index,
        };
        match self.pool.send_and_recv(&self.addr, &request).unwrap() {
            Response::RequestVote { term, vote_granted } => (term, vote_granted),
            other => panic!("unexpected response: {:?}", other),
        }
    }

    fn append_entries(
        &self,
        term: u64,
        port: u16,
        prev: (u64, u64),
        entries: Vec<LogEntry>,
        leader_commit: u64,
    ) -> (u64, bool, u64) {
        let request = Request::AppendEntries {
            term,
            ip: "127.0.0.1".to_string(),
            port,
            prev_log_index: prev.0,
            prev_log_term: prev.1,
            entries,
            leader_commit,
        };
        match self.pool.send_and_recv(&self.addr, &request).unwrap() {
            Response::AppendEntries { term, success, last_log_index } => {
                (term, success, last_log_index)
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    fn status(&self) -> ballast::ServerStatus {
        match self.pool.send_and_recv(&self.addr, &Request::ServerStatus).unwrap() {
            Response::ServerStatus(status) => status,
            other => panic!("unexpected response: {:?}", other),
        }
    }

    fn wait_applied(&self, target: u64) {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while self.status().last_applied < target {
            assert!(std::time::Instant::now() < deadline, "apply did not reach {}", target);
            std::thread::sleep(Duration::from_millis(20));
        }
    }
}

fn entry(term: u64, key: &[u8], value: &[u8]) -> LogEntry {
    LogEntry::new(term, OpType::Write, key.to_vec(), value.to_vec())
}

fn delete_entry(term: u64, key: &[u8]) -> LogEntry {
    LogEntry::new(term, OpType::Delete, key.to_vec(), Vec::new())
}

// =============================================================================
// RequestVote
// =============================================================================

#[test]
fn test_vote_granted_once_per_term() {
    let h = Harness::follower(21900);

    // First candidate in term 7 gets the vote.
    let (term, granted) = h.request_vote(7, 21901, 0, 0);
    assert!(granted);
    assert_eq!(term, 7);

    // A different candidate in the same term is refused.
    let (term, granted) = h.request_vote(7, 21902, 0, 0);
    assert!(!granted);
    assert_eq!(term, 7);

    // The original candidate re-asks and is re-granted.
    let (term, granted) = h.request_vote(7, 21901, 0, 0);
    assert!(granted);
    assert_eq!(term, 7);
}

#[test]
fn test_vote_denied_for_stale_term() {
    let h = Harness::follower(21905);

    let (_, granted) = h.request_vote(5, 21906, 0, 0);
    assert!(granted);

    let (term, granted) = h.request_vote(3, 21907, 0, 0);
    assert!(!granted);
    assert_eq!(term, 5);
}

#[test]
fn test_vote_denied_when_candidate_log_behind() {
    let h = Harness::follower(21910);

    // Give the node two entries in term 1.
    let (_, success, last) = h.append_entries(
        1,
        21911,
        (0, 0),
        vec![entry(1, b"a", b"1"), entry(1, b"b", b"2")],
        0,
    );
    assert!(success);
    assert_eq!(last, 2);

    // Same last term, shorter log: refused.
    let (_, granted) = h.request_vote(2, 21912, 1, 1);
    assert!(!granted);

    // Same last term, equal length: granted.
    let (_, granted) = h.request_vote(2, 21912, 1, 2);
    assert!(granted);

    // Higher last term wins regardless of length.
    let (_, granted) = h.request_vote(3, 21912, 2, 0);
    assert!(granted);
}

#[test]
fn test_vote_survives_restart() {
    let h = Harness::follower(21915);

    let (_, granted) = h.request_vote(7, 21916, 0, 0);
    assert!(granted);

    let h = h.restart();

    // The recovered vote still blocks a rival in term 7.
    let (term, granted) = h.request_vote(7, 21917, 0, 0);
    assert!(!granted);
    assert_eq!(term, 7);

    // A later term is a fresh vote.
    let (_, granted) = h.request_vote(8, 21917, 0, 0);
    assert!(granted);
}

// =============================================================================
// AppendEntries
// =============================================================================

#[test]
fn test_heartbeat_from_start_of_log() {
    let h = Harness::follower(21920);

    // Empty AppendEntries with prev_log_index = 0 is a pure heartbeat.
    let (term, success, last) = h.append_entries(1, 21921, (0, 0), Vec::new(), 0);
    assert!(success);
    assert_eq!(term, 1);
    assert_eq!(last, 0);

    let status = h.status();
    assert_eq!(status.term, 1);
    assert_eq!(status.leader.as_deref(), Some("127.0.0.1:21921"));
    assert_eq!(status.role, "follower");
}

#[test]
fn test_append_entries_stale_term_denied() {
    let h = Harness::follower(21925);

    let (_, success, _) = h.append_entries(5, 21926, (0, 0), Vec::new(), 0);
    assert!(success);

    let (term, success, _) = h.append_entries(3, 21927, (0, 0), Vec::new(), 0);
    assert!(!success);
    assert_eq!(term, 5);
}

#[test]
fn test_append_entries_replicates_and_applies() {
    let h = Harness::follower(21930);

    let (_, success, last) = h.append_entries(
        1,
        21931,
        (0, 0),
        vec![entry(1, b"a", b"1"), entry(1, b"b", b"2")],
        0,
    );
    assert!(success);
    assert_eq!(last, 2);

    // Nothing applies until the leader advances its commit index.
    assert_eq!(h.status().last_applied, 0);
    assert!(h.node.dirty_read(b"a").is_err());

    let (_, success, _) = h.append_entries(1, 21931, (2, 1), Vec::new(), 2);
    assert!(success);

    h.wait_applied(2);
    assert_eq!(h.node.dirty_read(b"a").unwrap(), b"1");
    assert_eq!(h.node.dirty_read(b"b").unwrap(), b"2");
    assert_eq!(h.status().commit_index, 2);
}

#[test]
fn test_append_entries_fast_rollback_hint() {
    let h = Harness::follower(21935);

    // prev beyond our tail: refused, and our tail is the hint.
    let (_, success, last) = h.append_entries(1, 21936, (5, 1), Vec::new(), 0);
    assert!(!success);
    assert_eq!(last, 0);
}

#[test]
fn test_append_entries_conflict_truncation() {
    let h = Harness::follower(21940);

    // Old leader replicated three term-1 entries.
    let (_, success, _) = h.append_entries(
        1,
        21941,
        (0, 0),
        vec![entry(1, b"a", b"1"), entry(1, b"b", b"2"), entry(1, b"c", b"3")],
        0,
    );
    assert!(success);

    // New leader in term 2 probes with prev = (2, term 2); our entry 2
    // has term 1, so the suffix from index 2 is truncated.
    let (_, success, last) = h.append_entries(2, 21942, (2, 2), Vec::new(), 0);
    assert!(!success);
    assert_eq!(last, 1);

    // The retry at prev = (1, 1) lands the term-2 suffix.
    let (_, success, last) = h.append_entries(
        2,
        21942,
        (1, 1),
        vec![entry(2, b"b", b"two"), entry(2, b"c", b"three")],
        3,
    );
    assert!(success);
    assert_eq!(last, 3);

    h.wait_applied(3);
    assert_eq!(h.node.dirty_read(b"a").unwrap(), b"1");
    assert_eq!(h.node.dirty_read(b"b").unwrap(), b"two");
    assert_eq!(h.node.dirty_read(b"c").unwrap(), b"three");
}

#[test]
fn test_stale_append_does_not_clobber_matching_suffix() {
    let h = Harness::follower(21945);

    let (_, success, _) =
        h.append_entries(1, 21946, (0, 0), vec![entry(1, b"a", b"1"), entry(1, b"b", b"2")], 0);
    assert!(success);

    // A duplicate of the first entry alone: already present, nothing
    // truncated, our longer log is reported back.
    let (_, success, last) = h.append_entries(1, 21946, (0, 0), vec![entry(1, b"a", b"1")], 0);
    assert!(success);
    assert_eq!(last, 2);

    // A stale empty heartbeat at an older prev point keeps the suffix.
    let (_, success, last) = h.append_entries(1, 21946, (1, 1), Vec::new(), 0);
    assert!(success);
    assert_eq!(last, 2);
}

#[test]
fn test_commit_index_monotonic_on_follower() {
    let h = Harness::follower(21950);

    let (_, success, _) = h.append_entries(
        1,
        21951,
        (0, 0),
        vec![entry(1, b"a", b"1"), entry(1, b"b", b"2")],
        2,
    );
    assert!(success);
    h.wait_applied(2);
    assert_eq!(h.status().commit_index, 2);

    // A reordered heartbeat with an older leader_commit cannot move the
    // commit index backward.
    let (_, success, _) = h.append_entries(1, 21951, (2, 1), Vec::new(), 1);
    assert!(success);
    assert_eq!(h.status().commit_index, 2);
}

#[test]
fn test_higher_term_append_adopts_leader_and_term() {
    let h = Harness::follower(21955);

    let (_, success, _) = h.append_entries(4, 21956, (0, 0), Vec::new(), 0);
    assert!(success);

    let status = h.status();
    assert_eq!(status.term, 4);
    assert_eq!(status.leader.as_deref(), Some("127.0.0.1:21956"));

    // A vote granted earlier in a lower term does not leak into the
    // adopted term.
    let (_, granted) = h.request_vote(5, 21957, 4, 0);
    assert!(granted);
}

#[test]
fn test_delete_entries_apply() {
    let h = Harness::follower(21960);

    let (_, success, _) = h.append_entries(
        1,
        21961,
        (0, 0),
        vec![entry(1, b"a", b"1"), delete_entry(1, b"a")],
        2,
    );
    assert!(success);

    h.wait_applied(2);
    assert!(matches!(h.node.dirty_read(b"a"), Err(ballast::BallastError::NotFound)));
}

#[test]
fn test_log_and_commit_survive_restart() {
    let h = Harness::follower(21965);

    let (_, success, _) = h.append_entries(
        1,
        21966,
        (0, 0),
        vec![entry(1, b"a", b"1"), entry(1, b"b", b"2")],
        2,
    );
    assert!(success);
    h.wait_applied(2);

    let h = h.restart();

    let status = h.status();
    assert_eq!(status.term, 1);
    assert_eq!(status.commit_index, 2);
    assert_eq!(status.last_log_index, 2);

    // The apply worker replays the committed prefix after restart.
    h.wait_applied(2);
    assert_eq!(h.node.dirty_read(b"a").unwrap(), b"1");

    // Replication continues from the recovered tail.
    let (_, success, last) = h.append_entries(1, 21966, (2, 1), vec![entry(1, b"c", b"3")], 3);
    assert!(success);
    assert_eq!(last, 3);
    h.wait_applied(3);
    assert_eq!(h.node.dirty_read(b"c").unwrap(), b"3");
}

// =============================================================================
// Dirty commands over the wire
// =============================================================================

#[test]
fn test_dirty_write_rpc_applies_locally() {
    let h = Harness::follower(21970);

    let request = Request::DirtyWrite { key: b"d".to_vec(), value: b"1".to_vec() };
    match h.pool.send_and_recv(&h.addr, &request).unwrap() {
        Response::Kv { code, .. } => assert_eq!(code, StatusCode::Ok),
        other => panic!("unexpected response: {:?}", other),
    }

    assert_eq!(h.node.dirty_read(b"d").unwrap(), b"1");
    // Dirty writes bypass the log entirely.
    assert_eq!(h.status().last_log_index, 0);
}
