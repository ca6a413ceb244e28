//! Inbound RPC dispatch: a TCP acceptor plus a fixed worker pool.

use super::message::{Request, Response};
use super::{write_frame, MAX_FRAME_BYTES};
use crate::error::{BallastError, Result};
use crossbeam_channel::unbounded;
use parking_lot::Mutex;
use std::io::{ErrorKind, Read};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Handles decoded requests. Implemented by the node facade.
pub trait Service: Send + Sync + 'static {
    fn call(&self, request: Request) -> Response;
}

/// The RPC server: one acceptor thread feeding connections to a fixed
/// pool of workers. A worker owns each connection for its lifetime and
/// serves requests on it sequentially.
pub struct RpcServer {
    addr: String,
    running: Arc<AtomicBool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl RpcServer {
    pub fn start(addr: &str, workers: usize, service: Arc<dyn Service>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .map_err(|e| BallastError::Network(format!("bind {}: {}", addr, e)))?;

        let running = Arc::new(AtomicBool::new(true));
        let (conn_tx, conn_rx) = unbounded::<TcpStream>();
        let mut handles = Vec::with_capacity(workers + 1);

        for i in 0..workers {
            let conn_rx = conn_rx.clone();
            let service = Arc::clone(&service);
            let running = Arc::clone(&running);
            handles.push(
                thread::Builder::new()
                    .name(format!("ballast-rpc-{}", i))
                    .spawn(move || {
                        while let Ok(stream) = conn_rx.recv() {
                            if !running.load(Ordering::Acquire) {
                                break;
                            }
                            serve_connection(stream, service.as_ref(), &running);
                        }
                    })?,
            );
        }

        {
            let running = Arc::clone(&running);
            handles.push(
                thread::Builder::new()
                    .name("ballast-rpc-accept".to_string())
                    .spawn(move || {
                        for stream in listener.incoming() {
                            if !running.load(Ordering::Acquire) {
                                break;
                            }
                            match stream {
                                Ok(stream) => {
                                    let _ = conn_tx.send(stream);
                                }
                                Err(e) => warn!(error = %e, "accept failed"),
                            }
                        }
                    })?,
            );
        }

        info!(addr, workers, "rpc server listening");
        Ok(Self {
            addr: addr.to_string(),
            running,
            handles: Mutex::new(handles),
        })
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        // One throwaway connection unblocks the acceptor.
        let _ = TcpStream::connect(&self.addr);
        for handle in self.handles.lock().drain(..) {
            let _ = handle.join();
        }
    }
}

/// Serve frames on one connection until the peer hangs up or the server
/// stops. Reads poll in short slices so shutdown is never blocked on a
/// quiet connection.
fn serve_connection(mut stream: TcpStream, service: &dyn Service, running: &AtomicBool) {
    if stream.set_read_timeout(Some(Duration::from_millis(100))).is_err() {
        return;
    }
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    loop {
        let mut len_buf = [0u8; 4];
        match read_full(&mut stream, &mut len_buf, running) {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                if e.kind() != ErrorKind::UnexpectedEof {
                    debug!(peer = %peer, error = %e, "closing connection");
                }
                return;
            }
        }

        let len = u32::from_be_bytes(len_buf);
        if len > MAX_FRAME_BYTES {
            warn!(peer = %peer, len, "oversized frame, closing connection");
            return;
        }

        let mut payload = vec![0u8; len as usize];
        match read_full(&mut stream, &mut payload, running) {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                debug!(peer = %peer, error = %e, "closing connection mid-frame");
                return;
            }
        }

        let request: Request = match bincode::deserialize(&payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(peer = %peer, error = %e, "undecodable request, closing connection");
                return;
            }
        };

        let response = service.call(request);
        if let Err(e) = write_frame(&mut stream, &response) {
            debug!(peer = %peer, error = %e, "failed to write response");
            return;
        }
    }
}

/// Fill `buf`, riding out read timeouts while the server is running.
/// Returns Ok(false) on shutdown.
fn read_full(
    stream: &mut TcpStream,
    buf: &mut [u8],
    running: &AtomicBool,
) -> std::io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => return Err(ErrorKind::UnexpectedEof.into()),
            Ok(n) => filled += n,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                if !running.load(Ordering::Acquire) {
                    return Ok(false);
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::client::ClientPool;
    use crate::rpc::message::StatusCode;

    struct EchoService;

    impl Service for EchoService {
        fn call(&self, request: Request) -> Response {
            match request {
                Request::Read { key } => Response::kv(StatusCode::Ok, key),
                _ => Response::kv_code(StatusCode::Error),
            }
        }
    }

    #[test]
    fn test_round_trip_through_server() {
        let server = RpcServer::start("127.0.0.1:21731", 2, Arc::new(EchoService)).unwrap();
        let pool = ClientPool::new(Duration::from_millis(500));

        let response = pool
            .send_and_recv("127.0.0.1:21731", &Request::Read { key: b"ping".to_vec() })
            .unwrap();
        match response {
            Response::Kv { code, value } => {
                assert_eq!(code, StatusCode::Ok);
                assert_eq!(value, b"ping");
            }
            other => panic!("unexpected response: {:?}", other),
        }

        server.stop();
    }

    #[test]
    fn test_stop_joins_workers() {
        let server = RpcServer::start("127.0.0.1:21732", 2, Arc::new(EchoService)).unwrap();
        let pool = ClientPool::new(Duration::from_millis(500));
        pool.send_and_recv("127.0.0.1:21732", &Request::Read { key: b"x".to_vec() })
            .unwrap();

        server.stop();
        // Stopping twice is harmless.
        server.stop();

        assert!(pool
            .send_and_recv("127.0.0.1:21732", &Request::Read { key: b"x".to_vec() })
            .is_err());
    }
}
