//! Raw TCP transport with length-prefixed message framing.
//!
//! A [`StreamSocket`] is what the TCP acceptor hands out for every accepted
//! connection. Messages travel as [`Frame::Message`] frames; a
//! [`Frame::Close`] notice tells the peer why the connection went away.
//!
//! # Reading
//!
//! Until [`Socket::start_streams`] is called, [`Socket::get_message`] reads
//! the stream directly on the caller's thread. After it, a named reader
//! thread decodes frames ahead of the consumer and parks them in a channel,
//! so the consumer only waits on the channel.

use std::collections::VecDeque;
use std::fmt;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread;

use anyhow::{bail, Context, Result};

use super::framing::{Frame, FrameDecoder};
use super::{AtomicConnectionState, ConnectionState, Socket, SocketId};
use crate::constants::{MAX_MESSAGE_SIZE, READ_BUFFER_SIZE, REASON_DROPPED, REASON_PROTOCOL_ERROR};

/// State shared with the reader thread.
#[derive(Debug)]
struct Shared {
    state: AtomicConnectionState,
    /// Reason from the peer's close notice, if one arrived.
    peer_reason: OnceLock<i32>,
}

/// Read-side state, guarded so only one consumer reads at a time.
#[derive(Debug)]
struct ReadSide {
    /// Moved into the reader thread by `start_streams`.
    decoder: Option<FrameDecoder>,
    /// Messages decoded but not yet handed out.
    ready: VecDeque<Vec<u8>>,
    /// Channel fed by the reader thread once streams are started.
    pump: Option<Receiver<Vec<u8>>>,
}

/// A framed TCP connection.
pub struct StreamSocket {
    id: SocketId,
    peer: SocketAddr,
    stream: TcpStream,
    shared: Arc<Shared>,
    reader: Mutex<ReadSide>,
    /// Serializes writers so frames never interleave.
    writer: Mutex<()>,
    max_message_size: u32,
    /// Set by `into_tcp_stream`; the connection lives on elsewhere.
    handed_off: AtomicBool,
}

impl fmt::Debug for StreamSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSocket")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.shared.state.load())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl StreamSocket {
    /// Wrap an established TCP stream.
    ///
    /// Messages longer than `max_message_size` are refused in both directions.
    ///
    /// # Errors
    ///
    /// Returns an error if the peer address cannot be read or the stream
    /// cannot be switched to blocking mode.
    pub fn from_stream(stream: TcpStream, max_message_size: u32) -> Result<Self> {
        let peer = stream.peer_addr().context("Failed to read peer address")?;
        // Streams accepted from a non-blocking listener inherit the flag on some platforms
        stream
            .set_nonblocking(false)
            .context("Failed to switch stream to blocking mode")?;
        // Frames are written whole; don't hold back small ones
        let _ = stream.set_nodelay(true);

        Ok(Self {
            id: SocketId::next(),
            peer,
            stream,
            shared: Arc::new(Shared {
                state: AtomicConnectionState::new(ConnectionState::Connected),
                peer_reason: OnceLock::new(),
            }),
            reader: Mutex::new(ReadSide {
                decoder: Some(FrameDecoder::new(max_message_size)),
                ready: VecDeque::new(),
                pump: None,
            }),
            writer: Mutex::new(()),
            max_message_size,
            handed_off: AtomicBool::new(false),
        })
    }

    /// Open a client connection speaking the same framing.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr).context("Failed to connect stream socket")?;
        Self::from_stream(stream, MAX_MESSAGE_SIZE)
    }

    /// Peer socket address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Reason carried by the peer's close notice, if the peer sent one.
    pub fn peer_close_reason(&self) -> Option<i32> {
        self.shared.peer_reason.get().copied()
    }

    /// Give up the framing layer and return the underlying stream.
    ///
    /// Used to run another protocol (the WebSocket handshake) over an
    /// accepted connection. Fails once streams have been started, since the
    /// reader thread may already have consumed bytes.
    pub fn into_tcp_stream(self) -> Result<(TcpStream, SocketAddr)> {
        if lock(&self.reader).pump.is_some() {
            bail!("Socket {} already has its reader thread running", self.id);
        }
        let stream = self
            .stream
            .try_clone()
            .with_context(|| format!("Failed to detach stream of socket {}", self.id))?;
        self.handed_off.store(true, Ordering::Release);
        Ok((stream, self.peer))
    }

    /// Record a close notice from the peer and tear the connection down.
    fn on_peer_close(&self, reason: i32) {
        let _ = self.shared.peer_reason.set(reason);
        if self.shared.state.mark_disconnected() {
            log::info!(
                "[StreamSocket {}] Peer {} closed the connection (reason {reason})",
                self.id,
                self.peer
            );
            let _ = self.stream.shutdown(Shutdown::Both);
        }
    }

    /// Send the close notice and shut the stream down, without touching the
    /// read side. Returns `false` if the socket was already disconnected.
    fn close_transport(&self, reason: i32) -> bool {
        if !self.shared.state.mark_disconnected() {
            return false;
        }
        log::info!(
            "[StreamSocket {}] Disconnecting {} (reason {reason})",
            self.id,
            self.peer
        );

        // Best-effort notice; skipped if a writer is stuck on a full buffer
        if let Ok(_guard) = self.writer.try_lock() {
            let _ = (&self.stream).write_all(&Frame::Close { reason }.encode());
        }
        let _ = self.stream.shutdown(Shutdown::Both);
        true
    }

    /// Direct read path, used before `start_streams`.
    fn read_direct(&self, read: &mut ReadSide) -> Option<Vec<u8>> {
        let decoder = read.decoder.as_mut()?;
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        loop {
            let n = match (&self.stream).read(&mut buf) {
                Ok(0) => {
                    if self.shared.state.mark_disconnected() {
                        log::info!("[StreamSocket {}] Peer {} hung up", self.id, self.peer);
                    }
                    return None;
                }
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    if self.shared.state.mark_disconnected() {
                        log::warn!("[StreamSocket {}] Read error: {e}", self.id);
                    }
                    return None;
                }
            };

            match decoder.feed(&buf[..n]) {
                Ok(frames) => {
                    for frame in frames {
                        match frame {
                            Frame::Message(data) => read.ready.push_back(data),
                            Frame::Close { reason } => {
                                self.on_peer_close(reason);
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    log::error!("[StreamSocket {}] Frame decode error: {e}", self.id);
                    self.close_transport(REASON_PROTOCOL_ERROR);
                    return None;
                }
            }

            if let Some(message) = read.ready.pop_front() {
                return Some(message);
            }
            if !self.is_connected() {
                return None;
            }
        }
    }
}

/// Reader thread body: decodes frames and forwards messages to the consumer.
///
/// Exits on EOF, read error, protocol error, peer close notice, or when the
/// consumer side of the channel is gone.
fn pump_loop(
    id: SocketId,
    mut stream: TcpStream,
    mut decoder: FrameDecoder,
    tx: Sender<Vec<u8>>,
    shared: Arc<Shared>,
) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    'read: loop {
        let n = match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                if shared.state.load() == ConnectionState::Connected {
                    log::warn!("[StreamSocket {id}] Read error: {e}");
                }
                break;
            }
        };

        let frames = match decoder.feed(&buf[..n]) {
            Ok(frames) => frames,
            Err(e) => {
                log::error!("[StreamSocket {id}] Frame decode error: {e}");
                break;
            }
        };

        for frame in frames {
            match frame {
                Frame::Message(data) => {
                    if tx.send(data).is_err() {
                        break 'read; // consumer gone
                    }
                }
                Frame::Close { reason } => {
                    let _ = shared.peer_reason.set(reason);
                    log::info!("[StreamSocket {id}] Peer closed the connection (reason {reason})");
                    break 'read;
                }
            }
        }
    }

    shared.state.mark_disconnected();
    let _ = stream.shutdown(Shutdown::Both);
    log::debug!("[StreamSocket {id}] Reader thread exiting");
}

impl Socket for StreamSocket {
    fn address(&self) -> String {
        self.peer.ip().to_string()
    }

    fn port(&self) -> u16 {
        self.peer.port()
    }

    fn start_streams(&self) {
        let mut read = lock(&self.reader);
        if read.pump.is_some() || !self.is_connected() {
            return;
        }
        let Some(decoder) = read.decoder.take() else {
            return;
        };

        let stream = match self.stream.try_clone() {
            Ok(stream) => stream,
            Err(e) => {
                log::error!("[StreamSocket {}] Failed to clone stream for reader: {e}", self.id);
                read.decoder = Some(decoder);
                return;
            }
        };

        let (tx, rx) = mpsc::channel();
        let id = self.id;
        let shared = Arc::clone(&self.shared);
        let spawn_result = thread::Builder::new()
            .name(format!("stream-socket-{id}"))
            .spawn(move || pump_loop(id, stream, decoder, tx, shared));

        match spawn_result {
            Ok(_) => read.pump = Some(rx),
            Err(e) => {
                log::error!("[StreamSocket {id}] Failed to spawn reader thread: {e}");
                drop(read);
                self.disconnect(REASON_PROTOCOL_ERROR);
            }
        }
    }

    fn disconnect(&self, reason: i32) {
        if !self.close_transport(reason) {
            return;
        }

        // The shutdown in close_transport unblocks any reader holding this lock
        let mut read = lock(&self.reader);
        read.ready.clear();
        read.pump = None;
    }

    fn is_connected(&self) -> bool {
        self.shared.state.load() == ConnectionState::Connected
    }

    fn is_connecting(&self) -> bool {
        self.shared.state.load() == ConnectionState::Connecting
    }

    fn get_message(&self) -> Option<Vec<u8>> {
        let mut guard = lock(&self.reader);
        let read = &mut *guard;

        if let Some(message) = read.ready.pop_front() {
            return Some(message);
        }

        if let Some(pump) = &read.pump {
            // Hand out what the reader already decoded, even after a peer close
            return match pump.try_recv() {
                Ok(message) => Some(message),
                Err(TryRecvError::Disconnected) => None,
                Err(TryRecvError::Empty) if !self.is_connected() => None,
                Err(TryRecvError::Empty) => pump.recv().ok(),
            };
        }

        if !self.is_connected() {
            return None;
        }
        self.read_direct(read)
    }

    fn put_message(&self, message: &[u8]) -> bool {
        if !self.is_connected() {
            return false;
        }
        if message.len() > self.max_message_size as usize {
            log::warn!(
                "[StreamSocket {}] Refusing {} byte message (max {})",
                self.id,
                message.len(),
                self.max_message_size
            );
            return false;
        }

        let encoded = Frame::Message(message.to_vec()).encode();
        let _guard = lock(&self.writer);
        match (&self.stream).write_all(&encoded) {
            Ok(()) => true,
            Err(e) => {
                log::debug!("[StreamSocket {}] Write error: {e}", self.id);
                false
            }
        }
    }

    fn socket_id(&self) -> SocketId {
        self.id
    }
}

impl Drop for StreamSocket {
    fn drop(&mut self) {
        if !self.handed_off.load(Ordering::Acquire) {
            self.disconnect(REASON_DROPPED);
        }
    }
}
