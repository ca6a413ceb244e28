//! Error types for Ballast.
//!
//! This module provides the unified error type [`BallastError`] for all
//! operations, along with a convenient [`Result`] type alias.
//!
//! # Example
//!
//! ```rust
//! use ballast::error::{BallastError, Result};
//!
//! fn check_key(key: &[u8]) -> Result<()> {
//!     if key.is_empty() {
//!         return Err(BallastError::Internal("key cannot be empty".into()));
//!     }
//!     Ok(())
//! }
//!
//! fn handle_error(err: &BallastError) {
//!     if err.is_retryable() {
//!         println!("Retrying operation...");
//!     } else {
//!         println!("Fatal error: {}", err);
//!     }
//! }
//! ```

use std::io;
use thiserror::Error;

/// Main error type for Ballast operations.
#[derive(Error, Debug)]
pub enum BallastError {
    // Consensus errors
    #[error("no leader elected yet")]
    NoLeader,

    #[error("apply wait timed out after {0}ms")]
    Timeout(u64),

    // Client command errors
    #[error("key not found")]
    NotFound,

    #[error("command failed: {0}")]
    Corruption(String),

    // Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    // Storage errors
    #[error("storage error: {0}")]
    Storage(String),

    // Network errors
    #[error("network error: {0}")]
    Network(String),

    // Serialization errors
    #[error("serialization error: {0}")]
    Serialization(String),

    // External errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl BallastError {
    /// Check if error is retryable.
    ///
    /// Retryable errors are transient cluster conditions: the client may
    /// re-issue the command once a leader is reachable again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BallastError::NoLeader | BallastError::Timeout(_) | BallastError::Network(_)
        )
    }
}

impl From<rocksdb::Error> for BallastError {
    fn from(e: rocksdb::Error) -> Self {
        BallastError::Storage(e.to_string())
    }
}

impl From<bincode::Error> for BallastError {
    fn from(e: bincode::Error) -> Self {
        BallastError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for BallastError {
    fn from(e: serde_json::Error) -> Self {
        BallastError::Serialization(e.to_string())
    }
}

/// Result type alias for Ballast operations.
pub type Result<T> = std::result::Result<T, BallastError>;
