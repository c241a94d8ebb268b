//! Listening endpoints that accept connections and hand them to consumers.
//!
//! # Architecture
//!
//! ```text
//!                 ┌──────────────────────────────┐
//!  listen() ────► │ TcpSocketServer              │
//!                 │  acceptor thread             │
//!                 │   TcpListener::accept        │
//!                 │   → StreamSocket             │
//!                 │   → PendingQueue (Mutex+Cv)  │
//!                 └──────────────┬───────────────┘
//!                                │ raw StreamSockets
//!                 ┌──────────────▼───────────────┐
//!                 │ WebSocketServer              │
//!                 │  opening handshake           │
//!                 │   → WebSocket                │
//!                 └──────────────────────────────┘
//! ```
//!
//! Consumers only see `Box<dyn Socket>` through the [`SocketServer`] trait.
//!
//! # Lifecycle
//!
//! `Idle → Listening → Closing → Closed`. A closed server may listen again.

pub(crate) mod queue;
pub mod tcp;
pub mod websocket;

use anyhow::Result;

use crate::constants::ANY_ADDRESS;
use crate::socket::Socket;

pub use tcp::TcpSocketServer;
pub use websocket::WebSocketServer;

/// Lifecycle state of a listening server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Never listened.
    Idle,
    /// Acceptor thread running, endpoint bound.
    Listening,
    /// `close()` in progress.
    Closing,
    /// Closed; may listen again.
    Closed,
}

impl ServerState {
    /// Whether `listen()` is allowed from this state.
    pub fn can_listen(self) -> bool {
        matches!(self, Self::Idle | Self::Closed)
    }
}

/// Capability contract for every listening endpoint.
///
/// All methods take `&self`; a server is meant to be shared between the
/// thread that owns its lifecycle and any number of consumer threads.
pub trait SocketServer: Send + Sync {
    /// Bind `address:port` and start accepting.
    ///
    /// An empty address means loopback. Port 0 picks an ephemeral port,
    /// readable afterwards through [`SocketServer::port`].
    ///
    /// # Errors
    ///
    /// Fails if the server is already listening or the bind fails. The
    /// server stays in its previous state.
    fn listen(&self, address: &str, port: u16) -> Result<()>;

    /// Bind every interface on `port`.
    fn listen_any(&self, port: u16) -> Result<()> {
        self.listen(ANY_ADDRESS, port)
    }

    /// Stop accepting, release the endpoint, and wake every blocked
    /// [`SocketServer::await_pending_socket`] caller. Unclaimed sockets are
    /// disconnected. Safe from any thread; a no-op when not listening.
    fn close(&self);

    /// True only while listening.
    fn is_listening(&self) -> bool;

    /// Whether a connection is waiting to be claimed.
    fn has_pending_sockets(&self) -> bool;

    /// Take the oldest pending connection without blocking.
    fn next_pending_socket(&self) -> Option<Box<dyn Socket>>;

    /// Block until a connection can be taken or the server closes.
    ///
    /// Returns `None` only because of a close.
    fn await_pending_socket(&self) -> Option<Box<dyn Socket>>;

    /// Configured listen address.
    fn address(&self) -> String;

    /// Bound port, 0 when not bound.
    fn port(&self) -> u16;
}
