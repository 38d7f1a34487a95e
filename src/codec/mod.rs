//! Codec module - body serialization and compression primitives.
//!
//! - [`MsgPackCodec`] - MessagePack using `rmp-serde` (struct-as-map)
//! - [`Lz4Codec`] - LZ4 block compression using `lz4_flex`
//!
//! # Design
//!
//! Codecs are marker structs with static methods. The handler pipeline's
//! default strategies wrap them; hosts that need another format register
//! their own strategies instead of touching the codecs.
//!
//! # Example
//!
//! ```
//! use tickwire::codec::{Lz4Codec, MsgPackCodec};
//!
//! let encoded = MsgPackCodec::encode(&"hello").unwrap();
//! let decoded: String = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, "hello");
//!
//! let packed = Lz4Codec::compress(&[0u8; 1024]);
//! assert_eq!(Lz4Codec::decompress(&packed).unwrap(), vec![0u8; 1024]);
//! ```

mod lz4;
mod msgpack;

pub use lz4::Lz4Codec;
pub use msgpack::MsgPackCodec;
