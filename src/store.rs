//! The applied-state key-value store.
//!
//! Committed log entries land here; dirty operations bypass the log and
//! touch this store directly.

use crate::error::Result;
use rocksdb::{Options as DbOptions, DB};
use std::path::Path;

/// RocksDB-backed store of applied key-value state.
pub struct KvStore {
    db: DB,
}

impl KvStore {
    /// Open or create the store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = DbOptions::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path)?;
        Ok(Self { db })
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(key)?)
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        Ok(self.db.put(key, value)?)
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        Ok(self.db.delete(key)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_put_get_delete() {
        let dir = tempdir().unwrap();
        let store = KvStore::open(dir.path()).unwrap();

        assert!(store.get(b"k").unwrap().is_none());

        store.put(b"k", b"v").unwrap();
        assert_eq!(store.get(b"k").unwrap().unwrap(), b"v");

        store.delete(b"k").unwrap();
        assert!(store.get(b"k").unwrap().is_none());
    }

    #[test]
    fn test_persistence_across_reopens() {
        let dir = tempdir().unwrap();

        {
            let store = KvStore::open(dir.path()).unwrap();
            store.put(b"durable", b"yes").unwrap();
        }

        let store = KvStore::open(dir.path()).unwrap();
        assert_eq!(store.get(b"durable").unwrap().unwrap(), b"yes");
    }
}
