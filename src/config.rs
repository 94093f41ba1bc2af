//! Client configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::transport::Backoff;

/// Wire protocol version written into every frame.
pub const PROTOCOL_VERSION: u8 = 1;

/// Default maximum number of message keys skipped in one decrypt call.
pub const DEFAULT_MAX_SKIP: usize = 100;

/// Default number of retired chains kept per contact.
pub const DEFAULT_PREVIOUS_CHAIN_LIMIT: usize = 10;

/// Default server address.
pub const DEFAULT_SERVER_ADDR: &str = "127.0.0.1:4011";

/// Default number of connection attempts.
pub const DEFAULT_CONNECT_ATTEMPTS: u32 = 10;

/// Default delay before the second connection attempt, in milliseconds.
pub const DEFAULT_INITIAL_BACKOFF_MS: u64 = 1000;

/// Default request timeout in milliseconds.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5000;

/// Default maximum frame payload (1 MiB).
pub const DEFAULT_MAX_PAYLOAD_LEN: usize = 1024 * 1024;

/// Ratchet limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RatchetConfig {
    /// Maximum number of message keys skipped in a single decrypt call.
    pub max_skip: usize,

    /// Number of retired chains kept for late messages.
    pub previous_chain_limit: usize,
}

impl Default for RatchetConfig {
    fn default() -> Self {
        Self {
            max_skip: DEFAULT_MAX_SKIP,
            previous_chain_limit: DEFAULT_PREVIOUS_CHAIN_LIMIT,
        }
    }
}

/// Connection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransportConfig {
    /// Server address as `host:port`.
    pub server_addr: String,

    /// Connection attempts before giving up.
    pub connect_attempts: u32,

    /// Delay after the first failed attempt; doubles after each failure.
    pub initial_backoff_ms: u64,

    /// How long `send_receive` waits for its response.
    pub request_timeout_ms: u64,

    /// Largest payload accepted in either direction.
    pub max_payload_len: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            server_addr: DEFAULT_SERVER_ADDR.to_string(),
            connect_attempts: DEFAULT_CONNECT_ATTEMPTS,
            initial_backoff_ms: DEFAULT_INITIAL_BACKOFF_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            max_payload_len: DEFAULT_MAX_PAYLOAD_LEN,
        }
    }
}

impl TransportConfig {
    /// Config pointing at the given server with default timings.
    pub fn new(server_addr: impl Into<String>) -> Self {
        Self {
            server_addr: server_addr.into(),
            ..Default::default()
        }
    }

    /// Override connection attempts and initial backoff.
    pub fn with_backoff(mut self, attempts: u32, initial_backoff_ms: u64) -> Self {
        self.connect_attempts = attempts;
        self.initial_backoff_ms = initial_backoff_ms;
        self
    }

    /// Override the request timeout.
    pub fn with_request_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.request_timeout_ms = timeout_ms;
        self
    }

    /// Request timeout as a `Duration`.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Backoff schedule for `connect`.
    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            self.connect_attempts,
            Duration::from_millis(self.initial_backoff_ms),
        )
    }

    /// Largest frame body (header plus payload) the reader will accept.
    pub fn max_frame_len(&self) -> usize {
        crate::protocol::MAX_HEADER_LEN + self.max_payload_len
    }
}

/// Complete client configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientConfig {
    /// Ratchet limits.
    pub ratchet: RatchetConfig,

    /// Connection settings.
    pub transport: TransportConfig,
}

impl ClientConfig {
    /// Default configuration for the given server.
    pub fn for_server(server_addr: impl Into<String>) -> Self {
        Self {
            ratchet: RatchetConfig::default(),
            transport: TransportConfig::new(server_addr),
        }
    }
}
