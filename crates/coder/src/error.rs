use thiserror::Error;

/// Result type alias for coder operations.
pub type Result<T> = std::result::Result<T, CoderError>;

/// Codec-related errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoderError {
    /// No coder is registered under this content type.
    #[error("Unknown content type: {0}")]
    UnknownContentType(String),

    /// Serialization failed.
    #[error("Failed to encode: {0}")]
    Encode(String),

    /// Deserialization failed.
    #[error("Failed to decode: {0}")]
    Decode(String),
}
