//! Pooled client connections for peer RPCs and leader redirects.

use super::message::{Request, Response};
use super::{read_frame, write_frame};
use crate::error::{BallastError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::debug;

/// Thread-safe pool of one connection per remote address.
///
/// A connection is checked out for the duration of an exchange, so
/// concurrent callers to the same address never interleave frames; a
/// second caller simply dials a transient connection.
pub struct ClientPool {
    conns: Mutex<HashMap<String, TcpStream>>,
    timeout: Duration,
}

impl ClientPool {
    pub fn new(timeout: Duration) -> Self {
        Self { conns: Mutex::new(HashMap::new()), timeout }
    }

    /// Send a request and block for its response, bounded by the pool
    /// timeout on connect, send, and receive.
    pub fn send_and_recv(&self, addr: &str, request: &Request) -> Result<Response> {
        let mut stream = match self.conns.lock().remove(addr) {
            Some(stream) => stream,
            None => self.connect(addr)?,
        };

        match Self::exchange(&mut stream, request) {
            Ok(response) => {
                self.check_in(addr, stream);
                Ok(response)
            }
            Err(first) => {
                // One redial covers a peer that restarted since the
                // pooled connection was last used.
                debug!(addr, error = %first, "pooled connection failed, redialing");
                let mut stream = self.connect(addr)?;
                let response = Self::exchange(&mut stream, request)?;
                self.check_in(addr, stream);
                Ok(response)
            }
        }
    }

    fn check_in(&self, addr: &str, stream: TcpStream) {
        // Keep at most one pooled connection per address; a transient
        // winner of a race is simply dropped.
        self.conns.lock().entry(addr.to_string()).or_insert(stream);
    }

    fn connect(&self, addr: &str) -> Result<TcpStream> {
        let sockaddr = addr
            .to_socket_addrs()
            .map_err(|e| BallastError::Network(format!("resolve {}: {}", addr, e)))?
            .next()
            .ok_or_else(|| BallastError::Network(format!("no address for {}", addr)))?;

        let stream = TcpStream::connect_timeout(&sockaddr, self.timeout)
            .map_err(|e| BallastError::Network(format!("connect {}: {}", addr, e)))?;
        stream
            .set_read_timeout(Some(self.timeout))
            .map_err(|e| BallastError::Network(e.to_string()))?;
        stream
            .set_write_timeout(Some(self.timeout))
            .map_err(|e| BallastError::Network(e.to_string()))?;
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }

    fn exchange(stream: &mut TcpStream, request: &Request) -> Result<Response> {
        write_frame(stream, request)?;
        read_frame(stream)
    }
}
