//! Server tunables and their loading.
//!
//! Values come from the built-in defaults in [`crate::constants`], then an
//! optional JSON file, then `ACCEPTOR_*` environment variables.

use std::path::Path;
use std::time::Duration;
use std::{fs, num::NonZeroUsize};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::constants;

/// Configuration shared by [`crate::TcpSocketServer`] and [`crate::WebSocketServer`].
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    /// Interval in milliseconds between accept attempts on a quiet listener.
    pub accept_poll_interval_ms: u64,
    /// Read timeout in milliseconds for established WebSocket streams.
    pub message_poll_interval_ms: u64,
    /// Deadline in milliseconds for a WebSocket opening handshake.
    pub handshake_timeout_ms: u64,
    /// Maximum number of unclaimed connections. `None` keeps the backlog unbounded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_pending: Option<NonZeroUsize>,
    /// Largest stream-socket message in bytes.
    pub max_message_size: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            accept_poll_interval_ms: constants::ACCEPT_POLL_INTERVAL.as_millis() as u64,
            message_poll_interval_ms: constants::MESSAGE_POLL_INTERVAL.as_millis() as u64,
            handshake_timeout_ms: constants::HANDSHAKE_TIMEOUT.as_millis() as u64,
            max_pending: None,
            max_message_size: constants::MAX_MESSAGE_SIZE,
        }
    }
}

impl ServerConfig {
    /// Loads configuration from an optional JSON file, then applies
    /// environment overrides and validates the result.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Reads a JSON config file. Missing keys keep their defaults.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Applies `ACCEPTOR_*` overrides using `lookup` as the variable source.
    ///
    /// Unparseable values are ignored.
    pub(crate) fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(value) = lookup("ACCEPTOR_ACCEPT_POLL_MS") {
            if let Ok(ms) = value.parse::<u64>() {
                self.accept_poll_interval_ms = ms;
            }
        }

        if let Some(value) = lookup("ACCEPTOR_MESSAGE_POLL_MS") {
            if let Ok(ms) = value.parse::<u64>() {
                self.message_poll_interval_ms = ms;
            }
        }

        if let Some(value) = lookup("ACCEPTOR_HANDSHAKE_TIMEOUT_MS") {
            if let Ok(ms) = value.parse::<u64>() {
                self.handshake_timeout_ms = ms;
            }
        }

        // 0 means "unbounded", matching the default
        if let Some(value) = lookup("ACCEPTOR_MAX_PENDING") {
            if let Ok(max) = value.parse::<usize>() {
                self.max_pending = NonZeroUsize::new(max);
            }
        }

        if let Some(value) = lookup("ACCEPTOR_MAX_MESSAGE_SIZE") {
            if let Ok(max) = value.parse::<u32>() {
                self.max_message_size = max;
            }
        }
    }

    /// Rejects values the servers cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.accept_poll_interval_ms == 0 {
            bail!("accept_poll_interval_ms must be greater than zero");
        }
        // A zero read timeout is rejected by the OS
        if self.message_poll_interval_ms == 0 {
            bail!("message_poll_interval_ms must be greater than zero");
        }
        if self.handshake_timeout_ms == 0 {
            bail!("handshake_timeout_ms must be greater than zero");
        }
        if self.max_message_size == 0 {
            bail!("max_message_size must be greater than zero");
        }
        Ok(())
    }

    /// Accept poll interval as a [`Duration`].
    pub fn accept_poll_interval(&self) -> Duration {
        Duration::from_millis(self.accept_poll_interval_ms.max(1))
    }

    /// WebSocket read timeout as a [`Duration`].
    pub fn message_poll_interval(&self) -> Duration {
        Duration::from_millis(self.message_poll_interval_ms.max(1))
    }

    /// Handshake deadline as a [`Duration`].
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms.max(1))
    }
}
