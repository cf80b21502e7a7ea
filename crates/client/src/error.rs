//! Error types for sessions and pools.

use std::io;
use std::time::Duration;
use tether_coder::CoderError;
use tether_packet::PacketError;
use thiserror::Error;

/// Result type alias for session operations.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors raised by a [`Session`](crate::Session).
#[derive(Debug, Error)]
pub enum ClientError {
    /// Could not reach the server.
    #[error("Failed to connect to {address}: {reason}")]
    Connect {
        /// Address that was dialed.
        address: String,
        /// Why the dial failed.
        reason: String,
    },

    /// No reply arrived in time.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// The session is not open.
    #[error("Session closed")]
    Closed,

    /// The server answered with an error status.
    #[error("Remote error {code}: {message}")]
    Remote {
        /// Status code.
        code: i32,
        /// Error message.
        message: String,
    },

    /// Framing or plugin failure.
    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),

    /// Body encode or decode failure.
    #[error("Coder error: {0}")]
    Coder(#[from] CoderError),

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// WebSocket failure.
    #[error("WebSocket error: {0}")]
    WebSocket(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(err.to_string())
    }
}

/// Errors raised by a [`Pool`](crate::Pool).
#[derive(Debug, Error)]
pub enum PoolError {
    /// No address became available within the dial timeout.
    #[error("No address available within {0:?}")]
    NoAddress(Duration),

    /// Every session is in use and none was returned in time.
    #[error("Pool exhausted: {live}/{max} sessions in use")]
    Exhausted {
        /// Live sessions.
        live: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Creating or checking a session failed.
    #[error("Session error: {0}")]
    Session(#[from] ClientError),

    /// The pool was closed.
    #[error("Pool closed")]
    Closed,
}
