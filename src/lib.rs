//! Ballast - a Raft-replicated key-value store.
//!
//! A fixed cluster of peers maintains a linearizable log of write and
//! delete operations against a durable RocksDB-backed store. Reads
//! replicate through the log too; "dirty" reads and writes bypass
//! consensus for callers that trade consistency for latency.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        Ballast node                          │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Facade: Write | Read | Delete | DirtyWrite | DirtyRead      │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Raft: Primary ticker | Peer replicators | Apply worker      │
//! ├──────────────────────────────────────────────────────────────┤
//! │  RPC: acceptor + worker pool | pooled client connections     │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Storage: applied KV (db/) | log entries + metadata (log/)   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use ballast::{Ballast, Options};
//!
//! fn main() -> ballast::Result<()> {
//!     let mut options = Options::default();
//!     options.single_mode = true;
//!
//!     let node = Ballast::open(options)?;
//!     node.write(b"greeting", b"hello")?;
//!     let value = node.read(b"greeting")?;
//!     assert_eq!(value, b"hello");
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod types;

pub mod node;
pub mod observability;
pub mod raft;
pub mod rpc;
pub mod store;

// Re-exports
pub use config::Options;
pub use error::{BallastError, Result};
pub use node::Ballast;
pub use rpc::{ServerStatus, StatusCode};
pub use types::Endpoint;
