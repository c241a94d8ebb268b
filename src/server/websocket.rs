//! WebSocket listening server.
//!
//! Raw acceptance is delegated to an owned [`TcpSocketServer`]. A connection
//! only reaches consumers after completing the WebSocket opening handshake;
//! connections that fail it are disconnected and never surface.
//!
//! # Blocking vs polling
//!
//! [`SocketServer::await_pending_socket`] drives each handshake to completion
//! and keeps pulling raw connections until one succeeds or the inner server
//! closes. There is no attempt limit. Each handshake runs on a non-blocking
//! stream in `accept_poll_interval` slices, so it ends at `handshake_timeout`
//! and a `close()` is noticed within one slice.
//!
//! [`SocketServer::next_pending_socket`] never waits on a peer. A handshake
//! that would block is parked and resumed on a later poll, oldest first;
//! parked handshakes past their deadline are discarded.

use std::collections::VecDeque;
use std::fmt;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Instant;

use anyhow::Result;
use tungstenite::handshake::server::{NoCallback, ServerHandshake};
use tungstenite::handshake::{HandshakeError, MidHandshake};

use super::tcp::TcpSocketServer;
use super::SocketServer;
use crate::config::ServerConfig;
use crate::socket::websocket::WsStream;
use crate::socket::{Socket, StreamSocket, WebSocket};

type PendingHandshake = MidHandshake<ServerHandshake<TcpStream, NoCallback>>;

/// A handshake waiting for more bytes from the peer.
struct Parked {
    handshake: PendingHandshake,
    peer: SocketAddr,
    deadline: Instant,
}

/// Result of pushing a handshake forward.
enum Progress {
    Done(WebSocket),
    Stalled(Parked),
    Failed,
}

/// Listening server that only yields upgraded WebSocket connections.
pub struct WebSocketServer {
    inner: TcpSocketServer,
    parked: Mutex<VecDeque<Parked>>,
}

impl fmt::Debug for WebSocketServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketServer")
            .field("inner", &self.inner)
            .field("parked", &self.lock_parked().len())
            .finish()
    }
}

impl Default for WebSocketServer {
    fn default() -> Self {
        Self::new(ServerConfig::default())
    }
}

impl WebSocketServer {
    /// Create an idle server.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            inner: TcpSocketServer::new(config),
            parked: Mutex::new(VecDeque::new()),
        }
    }

    /// The raw TCP server underneath.
    pub fn tcp(&self) -> &TcpSocketServer {
        &self.inner
    }

    /// Number of handshakes parked by non-blocking polls.
    pub fn parked_count(&self) -> usize {
        self.lock_parked().len()
    }

    fn lock_parked(&self) -> MutexGuard<'_, VecDeque<Parked>> {
        self.parked.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Detach the TCP stream from a freshly accepted socket and start the
    /// handshake on it without blocking.
    fn begin(&self, raw: StreamSocket) -> Progress {
        let id = raw.socket_id();
        let (stream, peer) = match raw.into_tcp_stream() {
            Ok(parts) => parts,
            Err(e) => {
                log::warn!("[WebSocket] Cannot upgrade socket {id}: {e:#}");
                return Progress::Failed;
            }
        };

        if let Err(e) = stream.set_nonblocking(true) {
            log::warn!("[WebSocket] Cannot prepare stream from {peer}: {e}");
            let _ = stream.shutdown(Shutdown::Both);
            return Progress::Failed;
        }

        let deadline = Instant::now() + self.inner.config().handshake_timeout();
        self.settle(tungstenite::accept(stream), peer, deadline)
    }

    /// Resume a parked handshake without blocking, unless its deadline passed.
    fn resume(&self, parked: Parked) -> Progress {
        if Instant::now() >= parked.deadline {
            log::warn!("[WebSocket] Handshake from {} timed out", parked.peer);
            abandon(&parked);
            return Progress::Failed;
        }

        let Parked { handshake, peer, deadline } = parked;
        self.settle(handshake.handshake(), peer, deadline)
    }

    /// Keep resuming a stalled handshake until it completes, fails, runs
    /// past its deadline, or the server stops listening.
    ///
    /// Each round is non-blocking, so a peer trickling bytes cannot hold the
    /// caller past the deadline and `close()` is noticed within one slice.
    fn finish(&self, mut progress: Progress) -> Progress {
        let slice = self.inner.config().accept_poll_interval();
        loop {
            let parked = match progress {
                Progress::Stalled(parked) => parked,
                settled => return settled,
            };
            if !self.inner.is_listening() {
                log::debug!("[WebSocket] Abandoning handshake from {}: server closed", parked.peer);
                abandon(&parked);
                return Progress::Failed;
            }
            thread::sleep(slice.min(parked.deadline.saturating_duration_since(Instant::now())));
            progress = self.resume(parked);
        }
    }

    /// Turn a handshake outcome into [`Progress`].
    fn settle(
        &self,
        outcome: Result<WsStream, HandshakeError<ServerHandshake<TcpStream, NoCallback>>>,
        peer: SocketAddr,
        deadline: Instant,
    ) -> Progress {
        match outcome {
            Ok(ws) => {
                match WebSocket::from_handshake(ws, peer, self.inner.config().message_poll_interval()) {
                    Ok(socket) => {
                        log::info!(
                            "[WebSocket] Upgraded connection from {peer} as socket {}",
                            socket.socket_id()
                        );
                        Progress::Done(socket)
                    }
                    Err(e) => {
                        log::warn!("[WebSocket] Cannot finish upgrade for {peer}: {e:#}");
                        Progress::Failed
                    }
                }
            }
            Err(HandshakeError::Interrupted(handshake)) => Progress::Stalled(Parked {
                handshake,
                peer,
                deadline,
            }),
            Err(HandshakeError::Failure(e)) => {
                // The TCP stream was moved into the failed handshake and is closed on drop
                log::warn!("[WebSocket] Handshake from {peer} failed, dropping connection: {e}");
                Progress::Failed
            }
        }
    }
}

/// Shut down the stream of a handshake that will not be resumed.
fn abandon(parked: &Parked) {
    let _ = parked.handshake.get_ref().get_ref().shutdown(Shutdown::Both);
}

impl SocketServer for WebSocketServer {
    fn listen(&self, address: &str, port: u16) -> Result<()> {
        self.inner.listen(address, port)
    }

    fn close(&self) {
        self.inner.close();
        let parked: Vec<_> = self.lock_parked().drain(..).collect();
        for handshake in &parked {
            abandon(handshake);
        }
    }

    fn is_listening(&self) -> bool {
        self.inner.is_listening()
    }

    /// True when a raw connection is queued or a handshake is parked. Either
    /// may still fail its handshake, so a following poll can come back empty.
    fn has_pending_sockets(&self) -> bool {
        self.inner.has_pending_sockets() || !self.lock_parked().is_empty()
    }

    fn next_pending_socket(&self) -> Option<Box<dyn Socket>> {
        // Parked handshakes first, oldest first; one pass each
        {
            let mut parked = self.lock_parked();
            for _ in 0..parked.len() {
                let Some(entry) = parked.pop_front() else {
                    break;
                };
                match self.resume(entry) {
                    Progress::Done(socket) => return Some(Box::new(socket)),
                    Progress::Stalled(entry) => parked.push_back(entry),
                    Progress::Failed => {}
                }
            }
        }

        while let Some(raw) = self.inner.next_pending_stream() {
            match self.begin(raw) {
                Progress::Done(socket) => return Some(Box::new(socket)),
                Progress::Stalled(entry) => self.lock_parked().push_back(entry),
                Progress::Failed => {}
            }
        }
        None
    }

    fn await_pending_socket(&self) -> Option<Box<dyn Socket>> {
        loop {
            // Finish anything a poll left behind before taking new connections
            let parked = self.lock_parked().pop_front();
            let progress = match parked {
                Some(entry) => self.resume(entry),
                None => self.begin(self.inner.await_pending_stream()?),
            };
            if let Progress::Done(socket) = self.finish(progress) {
                return Some(Box::new(socket));
            }
        }
    }

    fn address(&self) -> String {
        self.inner.address()
    }

    fn port(&self) -> u16 {
        self.inner.port()
    }
}

impl Drop for WebSocketServer {
    fn drop(&mut self) {
        self.close();
    }
}
