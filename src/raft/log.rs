//! Raft log entries and their durable store.

use crate::error::{BallastError, Result};
use crate::types::{LogIndex, Term};
use parking_lot::RwLock;
use rocksdb::{Direction, IteratorMode, Options as DbOptions, WriteBatch, WriteOptions, DB};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// Key prefix for log entries; the rest of the key is the big-endian
/// index, so RocksDB iteration order matches log order. Raft metadata
/// cells share this database under `m:`-prefixed keys.
const ENTRY_PREFIX: &[u8] = b"e";

/// Smallest key sorting above every entry key.
const ENTRY_UPPER_BOUND: &[u8] = b"f";

/// The operation a log entry applies to the KV store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpType {
    /// No state change; replicated only to order the read.
    Read,
    Write,
    Delete,
}

/// A single replicated log entry.
///
/// Indices start at 1 and are dense; index 0 is the implicit sentinel
/// with term 0. The store assigns indices at append time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,
    pub index: LogIndex,
    pub op: OpType,
    #[serde(with = "serde_bytes")]
    pub key: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub value: Vec<u8>,
}

impl LogEntry {
    /// Create an entry awaiting an index from [`LogStore::append`].
    pub fn new(term: Term, op: OpType, key: Vec<u8>, value: Vec<u8>) -> Self {
        Self { term, index: 0, op, key, value }
    }
}

/// Open the shared log+meta database under `path`.
pub fn open_log_db<P: AsRef<Path>>(path: P) -> Result<Arc<DB>> {
    let mut opts = DbOptions::default();
    opts.create_if_missing(true);
    let db = DB::open(&opts, path)?;
    Ok(Arc::new(db))
}

/// Durable, ordered store of log entries.
///
/// Appends are serialized internally; the tail (last term and index) is
/// cached and kept consistent with every append and truncation.
pub struct LogStore {
    db: Arc<DB>,
    tail: RwLock<(Term, LogIndex)>,
}

impl LogStore {
    pub fn new(db: Arc<DB>) -> Result<Self> {
        let tail = Self::scan_tail(&db)?;
        Ok(Self { db, tail: RwLock::new(tail) })
    }

    /// Append entries at the current tail, assigning dense indices.
    /// Returns the index of the last appended entry. The write is
    /// synced before returning; an IO failure surfaces as an error and
    /// the caller must abort its command.
    pub fn append(&self, mut entries: Vec<LogEntry>) -> Result<LogIndex> {
        if entries.is_empty() {
            return Err(BallastError::Internal("append of empty entry batch".into()));
        }

        let mut tail = self.tail.write();
        let mut batch = WriteBatch::default();
        let mut index = tail.1;
        for entry in &mut entries {
            index += 1;
            entry.index = index;
            batch.put(Self::entry_key(index), bincode::serialize(entry)?);
        }

        self.db.write_opt(batch, &Self::sync_writes())?;

        let last_term = entries.last().map(|e| e.term).unwrap_or(tail.0);
        *tail = (last_term, index);
        Ok(index)
    }

    /// Point lookup by index. Index 0 (the sentinel) yields `None`.
    pub fn entry(&self, index: LogIndex) -> Result<Option<LogEntry>> {
        if index == 0 {
            return Ok(None);
        }
        match self.db.get(Self::entry_key(index))? {
            Some(data) => Ok(Some(bincode::deserialize(&data)?)),
            None => Ok(None),
        }
    }

    /// Fetch entries in `[from, to]` inclusive, in log order.
    pub fn range(&self, from: LogIndex, to: LogIndex) -> Result<Vec<LogEntry>> {
        let mut entries = Vec::new();
        if from == 0 || from > to {
            return Ok(entries);
        }

        let start_key = Self::entry_key(from);
        let iter = self
            .db
            .iterator(IteratorMode::From(&start_key, Direction::Forward));

        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(ENTRY_PREFIX) || key.len() != ENTRY_PREFIX.len() + 8 {
                break;
            }
            let entry: LogEntry = bincode::deserialize(&value)?;
            if entry.index > to {
                break;
            }
            entries.push(entry);
        }

        Ok(entries)
    }

    /// Term and index of the last entry; (0, 0) when the log is empty.
    pub fn last_term_and_index(&self) -> (Term, LogIndex) {
        *self.tail.read()
    }

    pub fn last_index(&self) -> LogIndex {
        self.tail.read().1
    }

    /// Durably delete all entries with index >= `from`.
    pub fn truncate_suffix(&self, from: LogIndex) -> Result<()> {
        if from == 0 {
            return Err(BallastError::Internal("cannot truncate the sentinel entry".into()));
        }

        let mut tail = self.tail.write();
        if from > tail.1 {
            return Ok(());
        }

        let mut batch = WriteBatch::default();
        for index in from..=tail.1 {
            batch.delete(Self::entry_key(index));
        }
        self.db.write_opt(batch, &Self::sync_writes())?;

        let new_last = from - 1;
        let new_term = if new_last == 0 {
            0
        } else {
            match self.entry(new_last)? {
                Some(entry) => entry.term,
                None => {
                    return Err(BallastError::Storage(format!(
                        "log entry {} missing after truncation",
                        new_last
                    )))
                }
            }
        };
        *tail = (new_term, new_last);
        Ok(())
    }

    fn scan_tail(db: &DB) -> Result<(Term, LogIndex)> {
        let mut iter = db.iterator(IteratorMode::From(ENTRY_UPPER_BOUND, Direction::Reverse));
        if let Some(item) = iter.next() {
            let (key, value) = item?;
            if key.starts_with(ENTRY_PREFIX) && key.len() == ENTRY_PREFIX.len() + 8 {
                let entry: LogEntry = bincode::deserialize(&value)?;
                return Ok((entry.term, entry.index));
            }
        }
        Ok((0, 0))
    }

    fn entry_key(index: LogIndex) -> Vec<u8> {
        let mut key = ENTRY_PREFIX.to_vec();
        key.extend_from_slice(&index.to_be_bytes());
        key
    }

    fn sync_writes() -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(true);
        opts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_entry(term: Term, key: &[u8], value: &[u8]) -> LogEntry {
        LogEntry::new(term, OpType::Write, key.to_vec(), value.to_vec())
    }

    #[test]
    fn test_empty_log() {
        let dir = tempdir().unwrap();
        let log = LogStore::new(open_log_db(dir.path()).unwrap()).unwrap();

        assert_eq!(log.last_term_and_index(), (0, 0));
        assert!(log.entry(0).unwrap().is_none());
        assert!(log.entry(1).unwrap().is_none());
    }

    #[test]
    fn test_append_assigns_dense_indices() {
        let dir = tempdir().unwrap();
        let log = LogStore::new(open_log_db(dir.path()).unwrap()).unwrap();

        let last = log
            .append(vec![write_entry(1, b"a", b"1"), write_entry(1, b"b", b"2")])
            .unwrap();
        assert_eq!(last, 2);

        let last = log.append(vec![write_entry(2, b"c", b"3")]).unwrap();
        assert_eq!(last, 3);

        assert_eq!(log.last_term_and_index(), (2, 3));
        assert_eq!(log.entry(2).unwrap().unwrap().key, b"b");
        assert_eq!(log.entry(3).unwrap().unwrap().term, 2);
    }

    #[test]
    fn test_append_rejects_empty_batch() {
        let dir = tempdir().unwrap();
        let log = LogStore::new(open_log_db(dir.path()).unwrap()).unwrap();
        assert!(log.append(Vec::new()).is_err());
    }

    #[test]
    fn test_range() {
        let dir = tempdir().unwrap();
        let log = LogStore::new(open_log_db(dir.path()).unwrap()).unwrap();

        for i in 1..=5u8 {
            log.append(vec![write_entry(1, &[i], &[i])]).unwrap();
        }

        let entries = log.range(2, 4).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].index, 2);
        assert_eq!(entries[2].index, 4);

        assert!(log.range(6, 9).unwrap().is_empty());
        assert!(log.range(4, 2).unwrap().is_empty());
    }

    #[test]
    fn test_truncate_suffix() {
        let dir = tempdir().unwrap();
        let log = LogStore::new(open_log_db(dir.path()).unwrap()).unwrap();

        log.append(vec![
            write_entry(1, b"a", b"1"),
            write_entry(1, b"b", b"2"),
            write_entry(2, b"c", b"3"),
        ])
        .unwrap();

        log.truncate_suffix(2).unwrap();
        assert_eq!(log.last_term_and_index(), (1, 1));
        assert!(log.entry(2).unwrap().is_none());
        assert!(log.entry(3).unwrap().is_none());

        // Appends continue from the new tail.
        let last = log.append(vec![write_entry(3, b"d", b"4")]).unwrap();
        assert_eq!(last, 2);
        assert_eq!(log.last_term_and_index(), (3, 2));
    }

    #[test]
    fn test_truncate_to_empty() {
        let dir = tempdir().unwrap();
        let log = LogStore::new(open_log_db(dir.path()).unwrap()).unwrap();

        log.append(vec![write_entry(1, b"a", b"1")]).unwrap();
        log.truncate_suffix(1).unwrap();
        assert_eq!(log.last_term_and_index(), (0, 0));
    }

    #[test]
    fn test_tail_recovered_across_reopen() {
        let dir = tempdir().unwrap();

        {
            let log = LogStore::new(open_log_db(dir.path()).unwrap()).unwrap();
            log.append(vec![write_entry(4, b"a", b"1"), write_entry(5, b"b", b"2")])
                .unwrap();
        }

        let log = LogStore::new(open_log_db(dir.path()).unwrap()).unwrap();
        assert_eq!(log.last_term_and_index(), (5, 2));
    }
}
