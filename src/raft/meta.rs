//! Durable Raft metadata cells.
//!
//! Four independent cells in the log database: current term, the voted
//! endpoint (ip and port as separate cells), and the commit index. Every
//! setter is synced before it returns; this is the durability boundary
//! Raft relies on before answering RequestVote or AppendEntries.

use crate::error::{BallastError, Result};
use crate::types::{Endpoint, LogIndex, Term};
use rocksdb::{WriteOptions, DB};
use std::sync::Arc;

const CURRENT_TERM_KEY: &[u8] = b"m:current_term";
const VOTED_FOR_IP_KEY: &[u8] = b"m:voted_for_ip";
const VOTED_FOR_PORT_KEY: &[u8] = b"m:voted_for_port";
const COMMIT_INDEX_KEY: &[u8] = b"m:commit_index";

pub struct MetaStore {
    db: Arc<DB>,
}

impl MetaStore {
    pub fn new(db: Arc<DB>) -> Self {
        Self { db }
    }

    pub fn current_term(&self) -> Result<Term> {
        self.get_u64(CURRENT_TERM_KEY)
    }

    pub fn set_current_term(&self, term: Term) -> Result<()> {
        self.put(CURRENT_TERM_KEY, &term.to_be_bytes())
    }

    pub fn voted_for_ip(&self) -> Result<String> {
        match self.db.get(VOTED_FOR_IP_KEY)? {
            Some(data) => String::from_utf8(data)
                .map_err(|_| BallastError::Storage("voted_for_ip is not valid UTF-8".into())),
            None => Ok(String::new()),
        }
    }

    pub fn set_voted_for_ip(&self, ip: &str) -> Result<()> {
        self.put(VOTED_FOR_IP_KEY, ip.as_bytes())
    }

    pub fn voted_for_port(&self) -> Result<u16> {
        match self.db.get(VOTED_FOR_PORT_KEY)? {
            Some(data) => {
                let bytes: [u8; 2] = data.as_slice().try_into().map_err(|_| {
                    BallastError::Storage("voted_for_port cell is malformed".into())
                })?;
                Ok(u16::from_be_bytes(bytes))
            }
            None => Ok(0),
        }
    }

    pub fn set_voted_for_port(&self, port: u16) -> Result<()> {
        self.put(VOTED_FOR_PORT_KEY, &port.to_be_bytes())
    }

    pub fn commit_index(&self) -> Result<LogIndex> {
        self.get_u64(COMMIT_INDEX_KEY)
    }

    pub fn set_commit_index(&self, index: LogIndex) -> Result<()> {
        self.put(COMMIT_INDEX_KEY, &index.to_be_bytes())
    }

    /// Persist the term and vote together; `None` clears the vote.
    pub fn persist_term_and_vote(&self, term: Term, voted_for: Option<&Endpoint>) -> Result<()> {
        self.set_current_term(term)?;
        match voted_for {
            Some(endpoint) => {
                self.set_voted_for_ip(&endpoint.ip)?;
                self.set_voted_for_port(endpoint.port)?;
            }
            None => {
                self.set_voted_for_ip("")?;
                self.set_voted_for_port(0)?;
            }
        }
        Ok(())
    }

    fn get_u64(&self, key: &[u8]) -> Result<u64> {
        match self.db.get(key)? {
            Some(data) => {
                let bytes: [u8; 8] = data
                    .as_slice()
                    .try_into()
                    .map_err(|_| BallastError::Storage("metadata cell is malformed".into()))?;
                Ok(u64::from_be_bytes(bytes))
            }
            None => Ok(0),
        }
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut opts = WriteOptions::default();
        opts.set_sync(true);
        Ok(self.db.put_opt(key, value, &opts)?)
    }
}
