//! Established connections and their message-oriented I/O contract.
//!
//! Every accepted connection is exposed to consumers as a boxed [`Socket`],
//! regardless of the transport underneath.
//!
//! # Transports
//!
//! - [`StreamSocket`] - raw TCP with length-prefixed message framing (see [`framing`])
//! - [`WebSocket`] - TCP after a completed WebSocket opening handshake
//!
//! # Identity
//!
//! Each socket draws a [`SocketId`] from a process-wide counter at
//! construction. Ids are never reused within a process.

pub mod framing;
pub mod stream;
pub mod websocket;

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

pub use stream::StreamSocket;
pub use websocket::WebSocket;

/// Process-unique socket identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SocketId(u64);

impl SocketId {
    /// Allocate the next identifier.
    ///
    /// Starts at 1 and increases monotonically; wraparound is not handled.
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One established duplex connection.
///
/// All methods take `&self` so a socket can be shared (e.g. behind an `Arc`)
/// between a reading thread and a writing thread. Connection state queries
/// are advisory: a concurrent [`Socket::disconnect`] may land right after
/// they return.
pub trait Socket: Send + Sync + fmt::Debug {
    /// Peer IP address.
    fn address(&self) -> String;

    /// Peer port.
    fn port(&self) -> u16;

    /// Start whatever background I/O the transport needs (read-ahead).
    ///
    /// Call once before relying on message exchange. Repeated calls are
    /// no-ops in this crate's transports.
    fn start_streams(&self);

    /// Close the connection. `reason` is an opaque diagnostic code.
    ///
    /// Afterwards [`Socket::is_connected`] returns `false` and message
    /// operations fail without blocking.
    fn disconnect(&self, reason: i32);

    /// Whether the connection is established and not yet closed.
    fn is_connected(&self) -> bool;

    /// Whether the connection is still being established.
    fn is_connecting(&self) -> bool;

    /// Receive the next message, blocking until one arrives.
    ///
    /// Returns `None` on failure or once the connection is closed.
    fn get_message(&self) -> Option<Vec<u8>>;

    /// Send one whole message. Returns `false` if it could not be transmitted.
    fn put_message(&self, message: &[u8]) -> bool;

    /// This socket's immutable identifier.
    fn socket_id(&self) -> SocketId;
}

/// Lifecycle of a single connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Transport-level setup still in progress.
    Connecting = 0,
    /// Ready for message exchange.
    Connected = 1,
    /// Closed locally or by the peer.
    Disconnected = 2,
}

/// Atomic cell holding a [`ConnectionState`], shared with reader threads.
#[derive(Debug)]
pub(crate) struct AtomicConnectionState(AtomicU8);

impl AtomicConnectionState {
    pub(crate) fn new(state: ConnectionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub(crate) fn load(&self) -> ConnectionState {
        match self.0.load(Ordering::Acquire) {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }

    /// Move to `Disconnected`. Returns `true` only for the call that made
    /// the transition, so teardown runs once.
    pub(crate) fn mark_disconnected(&self) -> bool {
        self.0.swap(ConnectionState::Disconnected as u8, Ordering::AcqRel)
            != ConnectionState::Disconnected as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    #[test]
    fn test_socket_ids_are_unique_across_threads() {
        let handles: Vec<_> = (0..8)
            .map(|_| thread::spawn(|| (0..500).map(|_| SocketId::next()).collect::<Vec<_>>()))
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate socket id: {id}");
            }
        }
        assert_eq!(seen.len(), 8 * 500);
    }

    #[test]
    fn test_socket_ids_increase_and_skip_zero() {
        let first = SocketId::next();
        let second = SocketId::next();
        assert!(first.get() > 0);
        assert!(second > first);
    }

    #[test]
    fn test_mark_disconnected_transitions_once() {
        let state = AtomicConnectionState::new(ConnectionState::Connected);
        assert_eq!(state.load(), ConnectionState::Connected);
        assert!(state.mark_disconnected());
        assert!(!state.mark_disconnected());
        assert_eq!(state.load(), ConnectionState::Disconnected);
    }
}
