//! Serialization protocol for call results

use crate::error::Result;
use serde_json::Value;

/// Protocol for encoding and decoding result values
///
/// Implementations can provide custom serialization strategies
/// (JSON, bincode, etc.). The executor runs every result through the
/// configured codec before persisting it; a value the codec rejects is
/// recorded as a non-serializable-result failure.
pub trait Codec: Send + Sync {
    /// Serialize a value to bytes
    fn dumps(&self, value: &Value) -> Result<Vec<u8>>;

    /// Deserialize a value from bytes
    fn loads(&self, data: &[u8]) -> Result<Value>;
}

/// JSON-based codec (default)
#[derive(Debug, Clone, Default)]
pub struct JsonCodec;

impl JsonCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Codec for JsonCodec {
    fn dumps(&self, value: &Value) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn loads(&self, data: &[u8]) -> Result<Value> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Binary codec using bincode
#[derive(Debug, Clone, Default)]
pub struct BincodeCodec;

impl BincodeCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Codec for BincodeCodec {
    fn dumps(&self, value: &Value) -> Result<Vec<u8>> {
        Ok(bincode::serialize(value)?)
    }

    fn loads(&self, data: &[u8]) -> Result<Value> {
        Ok(bincode::deserialize(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_codec_round_trip() {
        let codec = JsonCodec::new();
        let value = json!({"name": "test", "items": [1, 2, 3]});

        let bytes = codec.dumps(&value).unwrap();
        let restored = codec.loads(&bytes).unwrap();

        assert_eq!(value, restored);
    }

    #[test]
    fn test_bincode_codec_round_trip() {
        let codec = BincodeCodec::new();
        let value = json!({"nested": {"value": 42}});

        let bytes = codec.dumps(&value).unwrap();
        let restored = codec.loads(&bytes).unwrap();

        assert_eq!(value, restored);
    }
}
