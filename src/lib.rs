//! Acceptor - threaded connection acceptance for stream and WebSocket transports.
//!
//! A listening server accepts inbound connections on a dedicated background
//! thread, buffers them in a FIFO of pending sockets, and hands them to
//! consumers one at a time, either through a non-blocking poll or a blocking
//! wait that only returns empty-handed when the server is closed.
//!
//! # Architecture
//!
//! ```text
//!  TcpListener ──accept──► acceptor thread ──push──► PendingQueue ──pop──► consumer
//!                                                        ▲
//!  WebSocketServer ── pulls raw StreamSockets ───────────┘
//!                     runs the opening handshake, yields WebSockets
//! ```
//!
//! # Modules
//!
//! - [`socket`] - the [`Socket`] contract plus the stream and WebSocket transports
//! - [`server`] - the [`SocketServer`] contract, the TCP accept loop, the WebSocket layer
//! - [`config`] - tunables with file and environment overrides
//! - [`constants`] - defaults and wire limits

pub mod config;
pub mod constants;
pub mod server;
pub mod socket;

// Re-export commonly used types
pub use config::ServerConfig;
pub use server::{ServerState, SocketServer, TcpSocketServer, WebSocketServer};
pub use socket::{Socket, SocketId, StreamSocket, WebSocket};
