//! Crate-wide defaults.
//!
//! Centralizes the timing and sizing values that [`crate::ServerConfig`]
//! falls back to, plus the address designations used by the listen calls.

use std::time::Duration;

// ============================================================================
// Addresses
// ============================================================================

/// Address used when `listen` is given an empty address.
pub const DEFAULT_ADDRESS: &str = "localhost";

/// Address used by `listen_any` to bind every interface.
pub const ANY_ADDRESS: &str = "0.0.0.0";

// ============================================================================
// Polling
// ============================================================================

/// How often the acceptor thread re-checks a quiet listener.
///
/// Also bounds how long `close()` waits for the acceptor thread to notice
/// the shutdown flag.
pub const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Read timeout applied to established WebSocket streams.
///
/// A blocked reader gives up the codec lock at this cadence so writers and
/// `disconnect` are never starved.
pub const MESSAGE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Upper bound for completing a WebSocket opening handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Limits
// ============================================================================

/// Largest stream-socket message accepted off the wire (16 MB).
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Read buffer size for stream sockets.
pub const READ_BUFFER_SIZE: usize = 64 * 1024;

// ============================================================================
// Disconnect reasons
// ============================================================================

/// Disconnect reason used when the owning server closes with sockets unclaimed
/// or accepts a connection while closing.
pub const REASON_SERVER_CLOSED: i32 = 1;

/// Disconnect reason used when the pending backlog is full.
pub const REASON_BACKLOG_FULL: i32 = 2;

/// Disconnect reason used when a socket is dropped while still connected.
pub const REASON_DROPPED: i32 = 4;

/// Disconnect reason used when the peer violates the framing protocol.
pub const REASON_PROTOCOL_ERROR: i32 = 5;
