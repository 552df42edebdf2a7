// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker connection error types.

use connect_protocol::{EnvelopeError, GatewayMessageType};
use thiserror::Error;

/// Errors that can occur while connecting to or talking with the gateway.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Configuration error (missing or invalid environment variable or setting)
    #[error("configuration error: {0}")]
    Config(String),

    /// Start or flush request was rejected with 401/403
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Start request was rejected with 429
    #[error("connection limit reached: {0}")]
    ConnectionLimit(String),

    /// Start request failed with any other non-2xx status
    #[error("handshake failed with status {status}: {body}")]
    Handshake {
        /// HTTP status code
        status: u16,
        /// Response body, if any
        body: String,
    },

    /// Transport-level HTTP failure
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// WebSocket transport failure
    #[error("socket error: {0}")]
    Socket(String),

    /// Socket did not open within the configured timeout
    #[error("socket connect timed out after {0}ms")]
    ConnectTimeout(u64),

    /// Attempted to send on a socket that is not open
    #[error("socket is not open")]
    SocketNotOpen,

    /// Envelope could not be encoded or decoded
    #[error("envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    /// First setup message was not a hello
    #[error("unexpected message during setup: {}", .0.as_str_name())]
    UnexpectedSetupMessage(GatewayMessageType),

    /// Setup handshake failed for another reason
    #[error("setup failed: {0}")]
    Setup(String),

    /// Setup handshake did not complete in time
    #[error("connection setup timed out after {0}ms")]
    SetupTimeout(u64),

    /// Gateway stopped answering heartbeats
    #[error("gateway heartbeat missed")]
    HeartbeatMissed,

    /// Socket closed or failed after setup
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// Some buffered replies could not be flushed
    #[error("flush incomplete: {0} replies still buffered")]
    FlushIncomplete(usize),

    /// The worker connection has been closed
    #[error("worker connection closed")]
    Closed,

    /// Internal worker error
    #[error("internal error: {0}")]
    Internal(String),
}

impl ConnectError {
    /// Whether this error should trigger a switch to the fallback credential.
    pub fn is_auth(&self) -> bool {
        matches!(self, ConnectError::Auth(_))
    }

    /// Whether the gateway refused the connection because of its connection limit.
    pub fn is_connection_limit(&self) -> bool {
        matches!(self, ConnectError::ConnectionLimit(_))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ConnectError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ConnectError::Socket(err.to_string())
    }
}

impl From<prost::DecodeError> for ConnectError {
    fn from(err: prost::DecodeError) -> Self {
        ConnectError::Envelope(EnvelopeError::Decode(err))
    }
}

/// Type alias for worker results.
pub type Result<T> = std::result::Result<T, ConnectError>;
