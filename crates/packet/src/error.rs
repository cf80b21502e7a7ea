//! Error types for packet framing.

use std::io;
use thiserror::Error;

/// Result type alias for packet operations.
pub type Result<T> = std::result::Result<T, PacketError>;

/// Errors raised while framing, unframing or transforming a packet.
#[derive(Debug, Error)]
pub enum PacketError {
    /// Packet exceeds the configured maximum payload.
    #[error("Packet size {size} exceeds maximum {max}")]
    TooLarge {
        /// Declared size of the whole frame.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Frame ended before a fixed-length field or section was complete.
    #[error("Packet truncated: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Bytes required.
        expected: usize,
        /// Bytes available.
        actual: usize,
    },

    /// Frame carries bytes beyond its declared header and body.
    #[error("Packet length mismatch: declared {declared} bytes, got {actual}")]
    LengthMismatch {
        /// Length implied by the prefix.
        declared: usize,
        /// Length of the frame received.
        actual: usize,
    },

    /// A transform plugin rejected the packet.
    #[error("Plugin error: {0}")]
    Plugin(String),

    /// Generic I/O error from the underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
