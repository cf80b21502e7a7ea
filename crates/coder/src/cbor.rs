use crate::error::{CoderError, Result};
use crate::{CONTENT_TYPE_CBOR, Coder};
use serde_json::Value;

/// CBOR bodies via ciborium.
#[derive(Debug, Clone, Copy, Default)]
pub struct CborCoder;

impl Coder for CborCoder {
    fn content_type(&self) -> &str {
        CONTENT_TYPE_CBOR
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        ciborium::into_writer(value, &mut bytes).map_err(|e| CoderError::Encode(e.to_string()))?;
        Ok(bytes)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value> {
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        ciborium::from_reader(bytes).map_err(|e| CoderError::Decode(e.to_string()))
    }
}
