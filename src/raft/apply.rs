//! Background application of committed entries.

use crate::error::Result;
use crate::raft::context::Context;
use crate::raft::log::{LogStore, OpType};
use crate::store::KvStore;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

enum ApplyTask {
    Drain,
    Stop,
}

/// Owns the worker thread that moves committed entries into the KV
/// store and advances last_applied.
pub struct Apply {
    tx: Sender<ApplyTask>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Apply {
    pub fn start(context: Arc<Context>, db: Arc<KvStore>, log: Arc<LogStore>) -> Result<Self> {
        // Capacity 2: one collapsed Drain plus the Stop sentinel.
        let (tx, rx) = bounded(2);
        let worker = ApplyWorker { context, db, log, rx };
        let handle = thread::Builder::new()
            .name("ballast-apply".to_string())
            .spawn(move || worker.run())?;
        Ok(Self { tx, handle: Mutex::new(Some(handle)) })
    }

    /// Queue one apply pass; redundant schedules collapse.
    pub fn schedule(&self) {
        match self.tx.try_send(ApplyTask::Drain) {
            Ok(()) | Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {}
        }
    }

    pub fn stop(&self) {
        let _ = self.tx.send(ApplyTask::Stop);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

struct ApplyWorker {
    context: Arc<Context>,
    db: Arc<KvStore>,
    log: Arc<LogStore>,
    rx: Receiver<ApplyTask>,
}

impl ApplyWorker {
    fn run(self) {
        while let Ok(task) = self.rx.recv() {
            match task {
                ApplyTask::Drain => self.drain(),
                ApplyTask::Stop => break,
            }
        }
    }

    /// Apply entries strictly in index order until last_applied catches
    /// up with commit_index. A KV failure aborts the pass without
    /// advancing last_applied; the next schedule retries the same entry.
    fn drain(&self) {
        loop {
            let target = self.context.commit_index();
            let next = self.context.last_applied() + 1;
            if next > target {
                return;
            }

            let entry = match self.log.entry(next) {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    error!(index = next, "committed entry missing from log store");
                    return;
                }
                Err(e) => {
                    error!(error = %e, index = next, "failed to read committed entry");
                    return;
                }
            };

            let outcome = match entry.op {
                OpType::Write => self.db.put(&entry.key, &entry.value),
                OpType::Delete => self.db.delete(&entry.key),
                OpType::Read => Ok(()),
            };

            if let Err(e) = outcome {
                error!(error = %e, index = next, "failed to apply entry, will retry");
                return;
            }

            self.context.bump_applied(next);
            debug!(index = next, term = entry.term, "applied entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::log::{open_log_db, LogEntry};
    use crate::raft::meta::MetaStore;
    use std::time::Duration;
    use tempfile::tempdir;

    fn fixture() -> (Arc<Context>, Arc<KvStore>, Arc<LogStore>, MetaStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let db = Arc::new(KvStore::open(dir.path().join("db")).unwrap());
        let log_db = open_log_db(dir.path().join("log")).unwrap();
        let log = Arc::new(LogStore::new(Arc::clone(&log_db)).unwrap());
        let meta = MetaStore::new(log_db);
        (Arc::new(Context::new()), db, log, meta, dir)
    }

    #[test]
    fn test_drains_committed_entries() {
        let (context, db, log, meta, _dir) = fixture();

        log.append(vec![
            LogEntry::new(1, OpType::Write, b"a".to_vec(), b"1".to_vec()),
            LogEntry::new(1, OpType::Write, b"b".to_vec(), b"2".to_vec()),
            LogEntry::new(1, OpType::Delete, b"a".to_vec(), Vec::new()),
        ])
        .unwrap();
        context.advance_commit_index(3, &meta).unwrap();

        let apply = Apply::start(Arc::clone(&context), Arc::clone(&db), Arc::clone(&log)).unwrap();
        apply.schedule();

        assert!(context.wait_applied(3, Duration::from_secs(2)));
        assert!(db.get(b"a").unwrap().is_none());
        assert_eq!(db.get(b"b").unwrap().unwrap(), b"2");

        apply.stop();
    }

    #[test]
    fn test_stops_at_commit_index() {
        let (context, db, log, meta, _dir) = fixture();

        log.append(vec![
            LogEntry::new(1, OpType::Write, b"a".to_vec(), b"1".to_vec()),
            LogEntry::new(1, OpType::Write, b"b".to_vec(), b"2".to_vec()),
        ])
        .unwrap();
        context.advance_commit_index(1, &meta).unwrap();

        let apply = Apply::start(Arc::clone(&context), Arc::clone(&db), Arc::clone(&log)).unwrap();
        apply.schedule();

        assert!(context.wait_applied(1, Duration::from_secs(2)));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(context.last_applied(), 1);
        assert!(db.get(b"b").unwrap().is_none());

        apply.stop();
    }

    #[test]
    fn test_read_entries_are_noops() {
        let (context, db, log, meta, _dir) = fixture();

        log.append(vec![LogEntry::new(1, OpType::Read, b"a".to_vec(), Vec::new())]).unwrap();
        context.advance_commit_index(1, &meta).unwrap();

        let apply = Apply::start(Arc::clone(&context), Arc::clone(&db), Arc::clone(&log)).unwrap();
        apply.schedule();

        assert!(context.wait_applied(1, Duration::from_secs(2)));
        assert!(db.get(b"a").unwrap().is_none());

        apply.stop();
    }
}
