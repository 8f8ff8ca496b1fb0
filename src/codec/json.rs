//! "json" codec: bodies as JSON via `serde_json`.
//!
//! Optional alternative to [`JobCodec`](super::JobCodec) for peers that
//! prefer text on the wire. Sections are still length-prefixed, so JSON
//! values need no delimiter of their own.

use crate::error::{Result, RpcError};

/// JSON codec for typed bodies.
pub struct JsonCodec;

impl JsonCodec {
    /// Encode a value to JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be serialized.
    #[inline]
    pub fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(RpcError::JsonEncode)
    }

    /// Decode JSON bytes to a value.
    ///
    /// # Errors
    ///
    /// Returns error if the bytes cannot be deserialized to type T.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).map_err(RpcError::JsonDecode)
    }
}
