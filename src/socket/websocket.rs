//! WebSocket transport over an accepted TCP stream.
//!
//! Framing, masking, ping/pong and close handshakes are handled by
//! `tungstenite`; this module adapts its synchronous API to the [`Socket`]
//! contract.
//!
//! # Locking
//!
//! The codec is not splittable in blocking mode, so reads and writes share one
//! mutex. Reads run with a short socket timeout: a reader waiting for data
//! drops the lock every `message_poll_interval` so writers and
//! [`Socket::disconnect`] get a turn.

// Rust guideline compliant 2026-02

use std::fmt;
use std::io::ErrorKind;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use tungstenite::{Error as WsError, Message};

use super::{AtomicConnectionState, ConnectionState, Socket, SocketId};
use crate::constants::REASON_DROPPED;

/// Codec type over a plain TCP stream.
pub(crate) type WsStream = tungstenite::WebSocket<TcpStream>;

/// A connection that completed the WebSocket opening handshake.
pub struct WebSocket {
    id: SocketId,
    peer: SocketAddr,
    state: AtomicConnectionState,
    inner: Mutex<WsStream>,
}

impl fmt::Debug for WebSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocket")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state.load())
            .finish_non_exhaustive()
    }
}

impl WebSocket {
    /// Wrap a codec whose handshake already completed.
    ///
    /// Puts the underlying stream in blocking mode with `poll_interval` as
    /// its read timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream options cannot be applied.
    pub(crate) fn from_handshake(
        ws: WsStream,
        peer: SocketAddr,
        poll_interval: Duration,
    ) -> Result<Self> {
        let stream = ws.get_ref();
        stream
            .set_nonblocking(false)
            .context("Failed to switch WebSocket stream to blocking mode")?;
        stream
            .set_read_timeout(Some(poll_interval))
            .context("Failed to set WebSocket read timeout")?;
        stream
            .set_write_timeout(None)
            .context("Failed to clear WebSocket write timeout")?;

        Ok(Self {
            id: SocketId::next(),
            peer,
            state: AtomicConnectionState::new(ConnectionState::Connected),
            inner: Mutex::new(ws),
        })
    }

    /// Peer socket address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn codec(&self) -> MutexGuard<'_, WsStream> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks the socket closed after a read or write failure.
    fn fail(&self, context: &str, err: &WsError) {
        if self.state.mark_disconnected() {
            match err {
                WsError::ConnectionClosed | WsError::AlreadyClosed => {
                    log::info!("[WebSocket {}] Peer {} closed the connection", self.id, self.peer);
                }
                _ => log::warn!("[WebSocket {}] {context} error: {err}", self.id),
            }
        }
    }
}

fn is_timeout(err: &WsError) -> bool {
    matches!(err, WsError::Io(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut))
}

impl Socket for WebSocket {
    fn address(&self) -> String {
        self.peer.ip().to_string()
    }

    fn port(&self) -> u16 {
        self.peer.port()
    }

    fn start_streams(&self) {
        // Reads are driven by get_message; the codec needs no pump
    }

    fn disconnect(&self, reason: i32) {
        if !self.state.mark_disconnected() {
            return;
        }
        log::info!(
            "[WebSocket {}] Disconnecting {} (reason {reason})",
            self.id,
            self.peer
        );

        let mut ws = self.codec();
        // Best effort: the peer may already be gone
        let _ = ws.close(None);
        let _ = ws.flush();
        let _ = ws.get_ref().shutdown(Shutdown::Both);
    }

    fn is_connected(&self) -> bool {
        self.state.load() == ConnectionState::Connected
    }

    fn is_connecting(&self) -> bool {
        self.state.load() == ConnectionState::Connecting
    }

    fn get_message(&self) -> Option<Vec<u8>> {
        loop {
            if !self.is_connected() {
                return None;
            }

            let result = self.codec().read();
            match result {
                Ok(Message::Text(text)) => return Some(text.into_bytes()),
                Ok(Message::Binary(data)) => return Some(data),
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => continue,
                Ok(Message::Close(frame)) => {
                    if self.state.mark_disconnected() {
                        let code = frame.map_or(1005, |cf| u16::from(cf.code));
                        log::info!(
                            "[WebSocket {}] Peer {} sent close (code {code})",
                            self.id,
                            self.peer
                        );
                    }
                    return None;
                }
                Err(e) if is_timeout(&e) => continue,
                Err(e) => {
                    self.fail("Read", &e);
                    return None;
                }
            }
        }
    }

    fn put_message(&self, message: &[u8]) -> bool {
        if !self.is_connected() {
            return false;
        }
        let result = self.codec().send(Message::Binary(message.to_vec()));
        match result {
            Ok(()) => true,
            Err(e) => {
                self.fail("Write", &e);
                false
            }
        }
    }

    fn socket_id(&self) -> SocketId {
        self.id
    }
}

impl Drop for WebSocket {
    fn drop(&mut self) {
        self.disconnect(REASON_DROPPED);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    /// Server-side WebSocket plus the client codec connected to it.
    fn ws_pair() -> (WebSocket, tungstenite::WebSocket<TcpStream>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let client = thread::spawn(move || {
            let stream = TcpStream::connect(addr).unwrap();
            let (ws, _response) = tungstenite::client(format!("ws://{addr}/"), stream).unwrap();
            ws
        });

        let (stream, peer) = listener.accept().unwrap();
        let ws = tungstenite::accept(stream).unwrap();
        let server = WebSocket::from_handshake(ws, peer, Duration::from_millis(20)).unwrap();
        (server, client.join().unwrap())
    }

    #[test]
    fn test_text_and_binary_both_arrive_as_bytes() {
        let (server, mut client) = ws_pair();

        client.send(Message::Text("hello".to_string())).unwrap();
        client.send(Message::Binary(vec![1, 2, 3])).unwrap();

        assert_eq!(server.get_message().unwrap(), b"hello");
        assert_eq!(server.get_message().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_put_message_sends_binary_frame() {
        let (server, mut client) = ws_pair();

        assert!(server.put_message(b"payload"));
        match client.read().unwrap() {
            Message::Binary(data) => assert_eq!(data, b"payload"),
            other => panic!("Expected Binary, got: {other:?}"),
        }
    }

    #[test]
    fn test_client_close_ends_reads() {
        let (server, mut client) = ws_pair();

        client.close(None).unwrap();
        client.flush().unwrap();

        assert!(server.get_message().is_none());
        assert!(!server.is_connected());
        assert!(!server.put_message(b"late"));
    }

    #[test]
    fn test_disconnect_sends_close_to_client() {
        let (server, mut client) = ws_pair();
        assert!(server.is_connected());
        assert!(!server.is_connecting());

        server.disconnect(0);
        assert!(!server.is_connected());
        assert!(server.get_message().is_none());

        match client.read() {
            Ok(Message::Close(_)) | Err(_) => {}
            Ok(other) => panic!("Expected close, got: {other:?}"),
        }
    }

    #[test]
    fn test_writer_not_starved_by_blocked_reader() {
        let (server, mut client) = ws_pair();
        let server = std::sync::Arc::new(server);

        let reader = {
            let server = std::sync::Arc::clone(&server);
            thread::spawn(move || server.get_message())
        };
        thread::sleep(Duration::from_millis(60));

        // The reader is parked in get_message; writing must still go through
        assert!(server.put_message(b"ping"));
        match client.read().unwrap() {
            Message::Binary(data) => assert_eq!(data, b"ping"),
            other => panic!("Expected Binary, got: {other:?}"),
        }

        client.send(Message::Binary(b"pong".to_vec())).unwrap();
        assert_eq!(reader.join().unwrap().unwrap(), b"pong");
    }
}
