//! Request/response plumbing between cluster members.
//!
//! Frames are a u32 big-endian length followed by a bincode payload;
//! both the server and the pooled client speak this framing over plain
//! TCP.

pub mod client;
pub mod message;
pub mod server;

pub use client::ClientPool;
pub use message::{Request, Response, ServerStatus, StatusCode};
pub use server::{RpcServer, Service};

use crate::error::{BallastError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Read, Write};

/// Upper bound on a single frame; anything larger is a protocol error.
const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

pub(crate) fn write_frame<W: Write, T: Serialize>(writer: &mut W, msg: &T) -> Result<()> {
    let payload = bincode::serialize(msg)?;
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

pub(crate) fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<T> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(BallastError::Network(format!("oversized frame: {} bytes", len)));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload)?;
    Ok(bincode::deserialize(&payload)?)
}
