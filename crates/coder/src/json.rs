use crate::error::{CoderError, Result};
use crate::{CONTENT_TYPE_JSON, Coder};
use serde_json::Value;

/// JSON bodies, the default coder.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCoder;

impl Coder for JsonCoder {
    fn content_type(&self) -> &str {
        CONTENT_TYPE_JSON
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| CoderError::Encode(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value> {
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(bytes).map_err(|e| CoderError::Decode(e.to_string()))
    }
}
