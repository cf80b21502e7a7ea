//! Error types for the server, router and handlers.

use std::error::Error as StdError;
use std::io;
use std::time::Duration;
use tether_broker::BrokerError;
use tether_coder::CoderError;
use tether_packet::PacketError;
use thiserror::Error;

/// Result type alias for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;

/// Status sent when a handler fails without choosing one.
pub const STATUS_INTERNAL_SERVER_ERROR: i32 = 500;

/// Status sent when a parameter cannot be decoded.
pub const STATUS_BAD_REQUEST: i32 = 400;

/// Status sent for an operator with no registered route.
pub const STATUS_NOT_FOUND: i32 = 404;

/// Errors raised by endpoints and connections.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Framing or plugin failure; fatal for the connection.
    #[error("Protocol error: {0}")]
    Packet(#[from] PacketError),

    /// Broker failure.
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// WebSocket failure.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// No packet arrived before the read deadline.
    #[error("Connection idle for {0:?}")]
    Timeout(Duration),

    /// A handler or connection task panicked.
    #[error("Task panicked: {0}")]
    Panicked(String),

    /// The connection is closed.
    #[error("Connection closed")]
    Closed,
}

/// Route registration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RouterError {
    /// Route hashes into the range used by internal operators.
    #[error("Route {route:?} hashes to reserved operator {operator}")]
    Reserved {
        /// Route name.
        route: String,
        /// Computed operator.
        operator: u32,
    },

    /// Route hashes to an operator that is already taken.
    #[error("Route {route:?} collides with {existing:?} on operator {operator}")]
    Collision {
        /// Route being registered.
        route: String,
        /// Route already registered.
        existing: String,
        /// Shared operator.
        operator: u32,
    },
}

/// Failure of a handler or middleware, turned into an error response.
#[derive(Debug, Error)]
pub enum Fault {
    /// Request body could not be decoded.
    #[error("Invalid parameter: {0}")]
    Param(CoderError),

    /// Response body could not be encoded.
    #[error("Coder error: {0}")]
    Coder(#[from] CoderError),

    /// Response could not be framed.
    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),

    /// Broker call failed.
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Response could not be written.
    #[error("Transport error: {0}")]
    Transport(#[from] ServerError),

    /// The request already has a response.
    #[error("Response already sent")]
    AlreadyResponded,

    /// Handler panicked.
    #[error("Handler panicked: {0}")]
    Panicked(String),

    /// Handler reported a failure.
    #[error("{0}")]
    Internal(String),

    /// Any other error raised inside a handler.
    #[error(transparent)]
    Other(Box<dyn StdError + Send + Sync>),
}

impl Fault {
    /// Wrap an arbitrary error.
    pub fn other(err: impl StdError + Send + Sync + 'static) -> Self {
        Self::Other(Box::new(err))
    }

    /// Status code used for the error response.
    #[must_use]
    pub const fn status(&self) -> i32 {
        match self {
            Self::Param(_) => STATUS_BAD_REQUEST,
            _ => STATUS_INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<String> for Fault {
    fn from(message: String) -> Self {
        Self::Internal(message)
    }
}

impl From<&str> for Fault {
    fn from(message: &str) -> Self {
        Self::Internal(message.to_string())
    }
}

/// Render a panic payload for logs and error responses.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_status() {
        assert_eq!(
            Fault::Param(CoderError::Decode("x".into())).status(),
            STATUS_BAD_REQUEST
        );
        assert_eq!(Fault::from("boom").status(), STATUS_INTERNAL_SERVER_ERROR);
        assert_eq!(Fault::from("boom").to_string(), "boom");
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("static");
        assert_eq!(panic_message(payload.as_ref()), "static");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
        let payload: Box<dyn std::any::Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}
