//! Body coders for tether.
//!
//! A [`Coder`] turns a [`serde_json::Value`] into bytes and back. Going through
//! a value keeps the trait object safe, so coders can live in a
//! [`CoderRegistry`] keyed by content type and be picked per request.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod cbor;
mod error;
mod json;
mod registry;

pub use cbor::CborCoder;
pub use error::{CoderError, Result};
pub use json::JsonCoder;
pub use registry::CoderRegistry;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Content type of the JSON coder.
pub const CONTENT_TYPE_JSON: &str = "text/json";

/// Alternative name accepted for the JSON coder.
pub const CONTENT_TYPE_JSON_ALIAS: &str = "application/json";

/// Content type of the CBOR coder.
pub const CONTENT_TYPE_CBOR: &str = "application/cbor";

/// Encodes and decodes packet bodies.
pub trait Coder: Send + Sync + 'static {
    /// The content type this coder is registered under.
    fn content_type(&self) -> &str;

    /// Encode a value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be represented.
    fn encode(&self, value: &Value) -> Result<Vec<u8>>;

    /// Decode bytes. An empty input decodes to [`Value::Null`].
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not valid for this format.
    fn decode(&self, bytes: &[u8]) -> Result<Value>;
}

/// Encode any serializable value with `coder`.
///
/// # Errors
///
/// Returns an error if the value cannot be converted or encoded.
pub fn encode_value<T>(coder: &dyn Coder, value: &T) -> Result<Vec<u8>>
where
    T: Serialize + ?Sized,
{
    let value = serde_json::to_value(value).map_err(|e| CoderError::Encode(e.to_string()))?;
    coder.encode(&value)
}

/// Decode bytes produced by `coder` into `T`.
///
/// # Errors
///
/// Returns an error if the bytes are malformed or do not match `T`.
pub fn decode_value<T>(coder: &dyn Coder, bytes: &[u8]) -> Result<T>
where
    T: DeserializeOwned,
{
    let value = coder.decode(bytes)?;
    serde_json::from_value(value).map_err(|e| CoderError::Decode(e.to_string()))
}
