//! "job" codec: MessagePack via `rmp-serde`.
//!
//! The default codec. Structs are encoded with `to_vec_named` (map format,
//! field names on the wire) so bodies stay self-describing and peers can
//! skip values they cannot type.
//!
//! # Example
//!
//! ```
//! use jobrpc::codec::JobCodec;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct Message {
//!     id: u32,
//!     content: String,
//! }
//!
//! let msg = Message { id: 42, content: "hello".to_string() };
//! let encoded = JobCodec::encode(&msg).unwrap();
//! let decoded: Message = JobCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, msg);
//! ```

use crate::error::Result;

/// MessagePack codec for typed bodies.
///
/// Uses `rmp_serde::to_vec_named`: struct fields travel by name, not by
/// position.
pub struct JobCodec;

impl JobCodec {
    /// Encode a value to MessagePack bytes.
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be serialized.
    #[inline]
    pub fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Decode MessagePack bytes to a value.
    ///
    /// # Errors
    ///
    /// Returns error if the bytes cannot be deserialized to type T.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}
