//! MsgPack body codec using `rmp-serde`.
//!
//! Message bodies are written with `to_vec_named`, so structs travel as maps
//! keyed by field name. Peers can add optional fields to a message type
//! without breaking older decoders, which is how message schemas evolve
//! under a fixed `MessageTypeId`.
//!
//! # Example
//!
//! ```
//! use tickwire::codec::MsgPackCodec;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct Move {
//!     x: i32,
//!     y: i32,
//! }
//!
//! let msg = Move { x: 4, y: -2 };
//! let encoded = MsgPackCodec::encode(&msg).unwrap();
//! let decoded: Move = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, msg);
//! ```

use crate::error::Result;

/// MessagePack codec for message bodies.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value to MsgPack bytes (struct-as-map).
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be serialized.
    #[inline]
    pub fn encode<T: serde::Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Decode MsgPack bytes to a value.
    ///
    /// # Errors
    ///
    /// Returns error if the bytes cannot be deserialized to type T.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}
