//! TCP listening server with a background acceptor thread.
//!
//! `listen()` binds a [`TcpListener`] and spawns a thread named
//! `acceptor-<port>` running [`accept_loop`]. Every accepted connection is
//! wrapped as a [`StreamSocket`] and pushed onto the pending queue, waking one
//! blocked consumer. `close()` wakes every consumer, stops the thread, and
//! disconnects whatever was never claimed.
//!
//! # Teardown
//!
//! The listener runs non-blocking and the acceptor re-checks a shutdown flag
//! between attempts, sleeping `accept_poll_interval` while the listener is
//! quiet. Dropping the listener when the loop ends releases the port.

use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use anyhow::{bail, Context, Result};

use super::queue::{PendingQueue, Refused};
use super::{ServerState, SocketServer};
use crate::config::ServerConfig;
use crate::constants::{DEFAULT_ADDRESS, REASON_BACKLOG_FULL, REASON_SERVER_CLOSED};
use crate::socket::{Socket, StreamSocket};

/// Handle to a running acceptor thread.
#[derive(Debug)]
struct Acceptor {
    shutdown: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Listening configuration, guarded independently from the queue.
#[derive(Debug)]
struct Endpoint {
    address: String,
    port: u16,
    state: ServerState,
    acceptor: Option<Acceptor>,
}

/// Raw-stream listening server.
#[derive(Debug)]
pub struct TcpSocketServer {
    config: ServerConfig,
    endpoint: Mutex<Endpoint>,
    queue: Arc<PendingQueue<StreamSocket>>,
}

impl Default for TcpSocketServer {
    fn default() -> Self {
        Self::new(ServerConfig::default())
    }
}

impl TcpSocketServer {
    /// Create an idle server.
    pub fn new(config: ServerConfig) -> Self {
        let queue = Arc::new(PendingQueue::new(config.max_pending));
        Self {
            config,
            endpoint: Mutex::new(Endpoint {
                address: DEFAULT_ADDRESS.to_string(),
                port: 0,
                state: ServerState::Idle,
                acceptor: None,
            }),
            queue,
        }
    }

    /// Configuration this server runs with.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ServerState {
        self.lock_endpoint().state
    }

    /// Number of accepted connections waiting to be claimed.
    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }

    /// Non-blocking dequeue with the concrete socket type.
    pub fn next_pending_stream(&self) -> Option<StreamSocket> {
        self.queue.try_pop()
    }

    /// Blocking dequeue with the concrete socket type.
    ///
    /// Returns `None` only when the server closes.
    pub fn await_pending_stream(&self) -> Option<StreamSocket> {
        self.queue.pop_wait()
    }

    fn lock_endpoint(&self) -> MutexGuard<'_, Endpoint> {
        self.endpoint.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SocketServer for TcpSocketServer {
    fn listen(&self, address: &str, port: u16) -> Result<()> {
        let mut endpoint = self.lock_endpoint();
        if !endpoint.state.can_listen() {
            bail!(
                "Server is already listening on {}:{} ({:?})",
                endpoint.address,
                endpoint.port,
                endpoint.state
            );
        }

        let address = if address.is_empty() { DEFAULT_ADDRESS } else { address };
        let listener = TcpListener::bind((address, port))
            .with_context(|| format!("Failed to bind {address}:{port}"))?;
        listener
            .set_nonblocking(true)
            .context("Failed to make listener non-blocking")?;
        let local_addr = listener
            .local_addr()
            .context("Failed to read bound address")?;

        self.queue.reopen();
        // Leave the queue refusing pushes again if the acceptor never starts
        let reopened = scopeguard::guard(Arc::clone(&self.queue), |queue| {
            queue.close();
        });

        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = {
            let queue = Arc::clone(&self.queue);
            let shutdown = Arc::clone(&shutdown);
            let config = self.config.clone();
            thread::Builder::new()
                .name(format!("acceptor-{}", local_addr.port()))
                .spawn(move || accept_loop(listener, local_addr, queue, shutdown, config))
                .context("Failed to spawn acceptor thread")?
        };
        scopeguard::ScopeGuard::into_inner(reopened);

        endpoint.address = address.to_string();
        endpoint.port = local_addr.port();
        endpoint.state = ServerState::Listening;
        endpoint.acceptor = Some(Acceptor { shutdown, handle });

        log::info!("[Acceptor] Listening on {address}:{} ({local_addr})", local_addr.port());
        Ok(())
    }

    fn close(&self) {
        let acceptor = {
            let mut endpoint = self.lock_endpoint();
            if endpoint.state != ServerState::Listening {
                // Still release anyone waiting on a server that never started
                self.queue.close();
                return;
            }
            endpoint.state = ServerState::Closing;
            endpoint.acceptor.take()
        };

        // Wake waiters first; the acceptor disconnects anything it accepts from here on
        let unclaimed = self.queue.close();
        if !unclaimed.is_empty() {
            log::info!("[Acceptor] Disconnecting {} unclaimed connection(s)", unclaimed.len());
        }
        for socket in unclaimed {
            socket.disconnect(REASON_SERVER_CLOSED);
        }

        if let Some(acceptor) = acceptor {
            acceptor.shutdown.store(true, Ordering::SeqCst);
            if acceptor.handle.join().is_err() {
                log::error!("[Acceptor] Acceptor thread panicked");
            }
        }

        let mut endpoint = self.lock_endpoint();
        log::info!("[Acceptor] Closed {}:{}", endpoint.address, endpoint.port);
        endpoint.state = ServerState::Closed;
        endpoint.port = 0;
    }

    fn is_listening(&self) -> bool {
        self.state() == ServerState::Listening
    }

    fn has_pending_sockets(&self) -> bool {
        self.queue.has_items()
    }

    fn next_pending_socket(&self) -> Option<Box<dyn Socket>> {
        self.next_pending_stream()
            .map(|socket| Box::new(socket) as Box<dyn Socket>)
    }

    fn await_pending_socket(&self) -> Option<Box<dyn Socket>> {
        self.await_pending_stream()
            .map(|socket| Box::new(socket) as Box<dyn Socket>)
    }

    fn address(&self) -> String {
        self.lock_endpoint().address.clone()
    }

    fn port(&self) -> u16 {
        self.lock_endpoint().port
    }
}

impl Drop for TcpSocketServer {
    fn drop(&mut self) {
        self.close();
    }
}

/// Acceptor thread body.
///
/// Runs until `shutdown` is set. Accept failures other than "nothing to
/// accept yet" are logged and retried after one poll interval.
fn accept_loop(
    listener: TcpListener,
    local_addr: SocketAddr,
    queue: Arc<PendingQueue<StreamSocket>>,
    shutdown: Arc<AtomicBool>,
    config: ServerConfig,
) {
    let poll_interval = config.accept_poll_interval();
    log::debug!("[Acceptor] Accept loop started on {local_addr}");

    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => enqueue(&queue, stream, peer, &config),
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(poll_interval),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                // ECONNABORTED, EMFILE and friends: keep the endpoint alive
                log::warn!("[Acceptor] Accept error on {local_addr}: {e}");
                thread::sleep(poll_interval);
            }
        }
    }

    drop(listener);
    log::debug!("[Acceptor] Accept loop on {local_addr} stopped");
}

/// Wrap an accepted stream and queue it for consumers.
fn enqueue(
    queue: &PendingQueue<StreamSocket>,
    stream: TcpStream,
    peer: SocketAddr,
    config: &ServerConfig,
) {
    let socket = match StreamSocket::from_stream(stream, config.max_message_size) {
        Ok(socket) => socket,
        Err(e) => {
            log::warn!("[Acceptor] Dropping connection from {peer}: {e:#}");
            return;
        }
    };

    let id = socket.socket_id();
    match queue.push(socket) {
        Ok(()) => log::debug!("[Acceptor] Queued connection from {peer} as socket {id}"),
        Err(Refused::Full(socket)) => {
            log::warn!("[Acceptor] Pending backlog full, dropping connection from {peer}");
            socket.disconnect(REASON_BACKLOG_FULL);
        }
        Err(Refused::Closing(socket)) => {
            log::info!("[Acceptor] Server closing, dropping connection from {peer}");
            socket.disconnect(REASON_SERVER_CLOSED);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::framing::{Frame, FrameDecoder};
    use std::io::Read;
    use std::num::NonZeroUsize;
    use std::time::{Duration, Instant};

    fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn test_initial_state() {
        let server = TcpSocketServer::default();
        assert_eq!(server.state(), ServerState::Idle);
        assert!(!server.is_listening());
        assert_eq!(server.port(), 0);
        assert_eq!(server.address(), DEFAULT_ADDRESS);
        assert!(!server.has_pending_sockets());
        assert!(server.next_pending_socket().is_none());
    }

    #[test]
    fn test_listen_on_port_zero_reports_bound_port() {
        let server = TcpSocketServer::default();
        server.listen("127.0.0.1", 0).unwrap();
        assert!(server.is_listening());
        assert_ne!(server.port(), 0);
        assert_eq!(server.address(), "127.0.0.1");
        server.close();
        assert_eq!(server.port(), 0);
    }

    #[test]
    fn test_listen_twice_rejected() {
        let server = TcpSocketServer::default();
        server.listen("127.0.0.1", 0).unwrap();
        let port = server.port();

        let err = server.listen("127.0.0.1", 0).unwrap_err().to_string();
        assert!(err.contains("already listening"), "unexpected error: {err}");
        assert!(server.is_listening());
        assert_eq!(server.port(), port);
    }

    #[test]
    fn test_bind_conflict_leaves_server_idle() {
        let holder = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = holder.local_addr().unwrap().port();

        let server = TcpSocketServer::default();
        let err = server.listen("127.0.0.1", port).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to bind"), "unexpected error: {err:#}");
        assert_eq!(server.state(), ServerState::Idle);
        assert_eq!(server.port(), 0);

        // A later listen on a free port still works
        server.listen("127.0.0.1", 0).unwrap();
        assert!(server.is_listening());
    }

    #[test]
    fn test_close_when_idle_is_noop() {
        let server = TcpSocketServer::default();
        server.close();
        assert_eq!(server.state(), ServerState::Idle);
    }

    #[test]
    fn test_close_wakes_waiter_on_idle_server() {
        let server = Arc::new(TcpSocketServer::default());
        let (tx, rx) = std::sync::mpsc::channel();
        {
            let server = Arc::clone(&server);
            thread::spawn(move || tx.send(server.await_pending_socket().is_none()).unwrap());
        }
        thread::sleep(Duration::from_millis(50));

        server.close();
        assert!(rx.recv_timeout(Duration::from_secs(2)).unwrap());
        assert_eq!(server.state(), ServerState::Idle);
    }

    #[test]
    fn test_close_wakes_waiter_after_failed_bind() {
        let taken = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let server = Arc::new(TcpSocketServer::default());
        assert!(server.listen("127.0.0.1", port).is_err());

        let (tx, rx) = std::sync::mpsc::channel();
        {
            let server = Arc::clone(&server);
            thread::spawn(move || tx.send(server.await_pending_socket().is_none()).unwrap());
        }
        thread::sleep(Duration::from_millis(50));

        server.close();
        assert!(rx.recv_timeout(Duration::from_secs(2)).unwrap());

        // The server is still usable afterwards
        drop(taken);
        server.listen("127.0.0.1", 0).unwrap();
        assert!(server.is_listening());
    }

    #[test]
    fn test_connection_accepted_while_closing_gets_server_closed_reason() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = StreamSocket::connect(listener.local_addr().unwrap()).unwrap();
        let (stream, peer) = listener.accept().unwrap();

        let queue = PendingQueue::new(None);
        assert!(queue.close().is_empty());
        enqueue(&queue, stream, peer, &ServerConfig::default());

        assert!(client.get_message().is_none());
        assert_eq!(client.peer_close_reason(), Some(REASON_SERVER_CLOSED));
    }

    #[test]
    fn test_relisten_after_close() {
        let server = TcpSocketServer::default();
        server.listen("127.0.0.1", 0).unwrap();
        server.close();
        assert_eq!(server.state(), ServerState::Closed);

        server.listen("127.0.0.1", 0).unwrap();
        let _client = TcpStream::connect(("127.0.0.1", server.port())).unwrap();
        let socket = server.await_pending_socket().expect("socket after re-listen");
        assert!(socket.is_connected());
    }

    #[test]
    fn test_close_releases_port() {
        let server = TcpSocketServer::default();
        server.listen("127.0.0.1", 0).unwrap();
        let port = server.port();
        server.close();

        let rebound = TcpListener::bind(("127.0.0.1", port));
        assert!(rebound.is_ok(), "port {port} still held after close");
    }

    #[test]
    fn test_close_disconnects_unclaimed_sockets() {
        let server = TcpSocketServer::default();
        server.listen("127.0.0.1", 0).unwrap();
        let client = StreamSocket::connect(("127.0.0.1", server.port())).unwrap();
        assert!(wait_for(Duration::from_secs(2), || server.has_pending_sockets()));

        server.close();
        assert!(!server.has_pending_sockets());
        assert!(client.get_message().is_none());
        assert_eq!(client.peer_close_reason(), Some(REASON_SERVER_CLOSED));
    }

    #[test]
    fn test_bounded_backlog_drops_excess_connections() {
        let config = ServerConfig {
            max_pending: NonZeroUsize::new(2),
            ..ServerConfig::default()
        };
        let server = TcpSocketServer::new(config);
        server.listen("127.0.0.1", 0).unwrap();

        let mut clients: Vec<TcpStream> = (0..4)
            .map(|_| TcpStream::connect(("127.0.0.1", server.port())).unwrap())
            .collect();

        assert!(wait_for(Duration::from_secs(2), || server.pending_count() == 2));

        let mut dropped = 0;
        for client in &mut clients {
            client.set_read_timeout(Some(Duration::from_millis(300))).unwrap();
            let mut buf = [0u8; 64];
            if let Ok(n) = client.read(&mut buf) {
                if n > 0 {
                    let frames = FrameDecoder::default().feed(&buf[..n]).unwrap();
                    assert_eq!(frames, vec![Frame::Close { reason: REASON_BACKLOG_FULL }]);
                    dropped += 1;
                }
            }
        }
        assert_eq!(dropped, 2);
        assert_eq!(server.pending_count(), 2);
    }

    #[test]
    fn test_pending_sockets_report_peer_endpoint() {
        let server = TcpSocketServer::default();
        server.listen("127.0.0.1", 0).unwrap();
        let client = TcpStream::connect(("127.0.0.1", server.port())).unwrap();

        let socket = server.await_pending_stream().unwrap();
        assert_eq!(socket.address(), "127.0.0.1");
        assert_eq!(socket.port(), client.local_addr().unwrap().port());
    }
}
