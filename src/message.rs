//! Application message model.
//!
//! A [`Message`] is anything the channel can put on the wire. Two
//! capabilities matter to the networking layer:
//!
//! - **heartbeat-shaped**: [`Message::is_heartbeat`] is true. Determined by
//!   the type, never by an instance field.
//! - **response-shaped**: [`Message::error_code`] returns `Some`. Zero means
//!   success. Only response-shaped messages take part in RPC correlation.
//!
//! Inbound bodies are materialized through [`MessageTypes`], an explicit
//! `MessageTypeId -> decoder` table populated by the host at startup.
//!
//! # Example
//!
//! ```
//! use std::any::Any;
//! use serde::{Deserialize, Serialize};
//! use tickwire::codec::MsgPackCodec;
//! use tickwire::message::{Message, MessageType, MessageTypes};
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct Chat {
//!     #[serde(skip)]
//!     unique_id: u32,
//!     text: String,
//! }
//!
//! impl Message for Chat {
//!     fn message_type_id(&self) -> u32 { Self::TYPE_ID }
//!     fn unique_id(&self) -> u32 { self.unique_id }
//!     fn set_unique_id(&mut self, unique_id: u32) { self.unique_id = unique_id }
//!     fn encode(&self) -> tickwire::Result<Vec<u8>> { MsgPackCodec::encode(self) }
//!     fn as_any(&self) -> &dyn Any { self }
//! }
//!
//! impl MessageType for Chat {
//!     const TYPE_ID: u32 = 1001;
//! }
//!
//! let mut types = MessageTypes::new();
//! types.register::<Chat>();
//!
//! let body = Chat { unique_id: 0, text: "hi".into() }.encode().unwrap();
//! let decoded = types.decode(1001, &body).unwrap();
//! assert_eq!(decoded.downcast_ref::<Chat>().unwrap().text, "hi");
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::fmt;

use serde::de::DeserializeOwned;
use tracing::debug;

use crate::codec::MsgPackCodec;
use crate::error::{NetworkError, Result};

/// Message type id reserved for the built-in [`Heartbeat`].
pub const HEARTBEAT_TYPE_ID: u32 = 0;

/// An application payload that can travel over a channel.
pub trait Message: Any + Send + Sync + fmt::Debug {
    /// Schema id written to the header's `MessageTypeId` field.
    fn message_type_id(&self) -> u32;

    /// Correlation id written to the header's `UniqueId` field.
    fn unique_id(&self) -> u32;

    /// Overwrite the correlation id. Called on inbound messages with the
    /// value carried by the header.
    fn set_unique_id(&mut self, unique_id: u32);

    /// True for liveness heartbeats and their acknowledgements.
    fn is_heartbeat(&self) -> bool {
        false
    }

    /// True for a heartbeat sent in answer to a peer's heartbeat. Only
    /// meaningful when [`Message::is_heartbeat`] is true.
    fn is_heartbeat_ack(&self) -> bool {
        false
    }

    /// `Some(code)` for response-shaped messages, `None` otherwise.
    fn error_code(&self) -> Option<i32> {
        None
    }

    /// Serialize the body (uncompressed).
    fn encode(&self) -> Result<Vec<u8>>;

    /// Upcast for downcasting to the concrete type.
    fn as_any(&self) -> &dyn Any;
}

impl dyn Message {
    /// Downcast to a concrete message type.
    #[inline]
    pub fn downcast_ref<T: Message>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    /// Check the concrete type.
    #[inline]
    pub fn is<T: Message>(&self) -> bool {
        self.as_any().is::<T>()
    }
}

/// A message type with a fixed id and a serde representation.
///
/// Types implementing this can be registered with [`MessageTypes::register`]
/// and are decoded from MsgPack.
pub trait MessageType: Message + DeserializeOwned {
    /// Schema id for this type.
    const TYPE_ID: u32;
}

/// Decoder from body bytes to a boxed message.
pub type DecodeFn = fn(&[u8]) -> Result<Box<dyn Message>>;

/// Table of known message types keyed by `MessageTypeId`.
///
/// Starts with [`Heartbeat`] registered. Registering an id twice replaces
/// the earlier decoder.
#[derive(Clone)]
pub struct MessageTypes {
    decoders: HashMap<u32, DecodeFn>,
}

impl MessageTypes {
    /// Create a table containing only the built-in heartbeat.
    pub fn new() -> Self {
        let mut types = Self {
            decoders: HashMap::new(),
        };
        types.register_with(HEARTBEAT_TYPE_ID, decode_heartbeat);
        types
    }

    /// Register `T`, decoded from MsgPack.
    pub fn register<T: MessageType>(&mut self) -> &mut Self {
        self.register_with(T::TYPE_ID, decode_msgpack::<T>)
    }

    /// Register a custom decoder for `message_type_id`.
    pub fn register_with(&mut self, message_type_id: u32, decoder: DecodeFn) -> &mut Self {
        if self.decoders.insert(message_type_id, decoder).is_some() {
            debug!(message_type_id, "Replaced message decoder");
        }
        self
    }

    /// Materialize a message from body bytes.
    ///
    /// # Errors
    ///
    /// Returns `UnknownMessageType` for unregistered ids, or the decoder's
    /// error.
    pub fn decode(&self, message_type_id: u32, body: &[u8]) -> Result<Box<dyn Message>> {
        let decoder = self
            .decoders
            .get(&message_type_id)
            .ok_or(NetworkError::UnknownMessageType(message_type_id))?;
        decoder(body)
    }

    /// Check whether `message_type_id` is registered.
    pub fn contains(&self, message_type_id: u32) -> bool {
        self.decoders.contains_key(&message_type_id)
    }

    /// Number of registered types, including the heartbeat.
    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    /// Always false after `new`; kept for API symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }
}

impl Default for MessageTypes {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MessageTypes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<_> = self.decoders.keys().copied().collect();
        ids.sort_unstable();
        f.debug_struct("MessageTypes").field("ids", &ids).finish()
    }
}

fn decode_msgpack<T: MessageType>(body: &[u8]) -> Result<Box<dyn Message>> {
    let message: T = MsgPackCodec::decode(body)?;
    Ok(Box::new(message))
}

fn decode_heartbeat(_body: &[u8]) -> Result<Box<dyn Message>> {
    Ok(Box::new(Heartbeat::new()))
}

/// Built-in liveness heartbeat. Empty body, type id [`HEARTBEAT_TYPE_ID`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Heartbeat {
    unique_id: u32,
    ack: bool,
}

impl Heartbeat {
    /// Create a heartbeat request with unique id 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the answer to a peer's heartbeat.
    pub fn ack() -> Self {
        Self {
            unique_id: 0,
            ack: true,
        }
    }
}

impl Message for Heartbeat {
    fn message_type_id(&self) -> u32 {
        HEARTBEAT_TYPE_ID
    }

    fn unique_id(&self) -> u32 {
        self.unique_id
    }

    fn set_unique_id(&mut self, unique_id: u32) {
        self.unique_id = unique_id;
    }

    fn is_heartbeat(&self) -> bool {
        true
    }

    fn is_heartbeat_ack(&self) -> bool {
        self.ack
    }

    fn encode(&self) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn test_heartbeat_is_preregistered() {
        let types = MessageTypes::new();
        assert!(types.contains(HEARTBEAT_TYPE_ID));

        let decoded = types.decode(HEARTBEAT_TYPE_ID, &[]).unwrap();
        assert!(decoded.is_heartbeat());
        assert!(decoded.is::<Heartbeat>());
    }

    #[test]
    fn test_register_and_decode() {
        let types = test_types();
        let body = Ping::new(0, "hello").encode().unwrap();

        let decoded = types.decode(Ping::TYPE_ID, &body).unwrap();
        let ping = decoded.downcast_ref::<Ping>().unwrap();
        assert_eq!(ping.text, "hello");
        assert!(decoded.error_code().is_none());
    }

    #[test]
    fn test_unknown_type_id() {
        let types = MessageTypes::new();
        let err = types.decode(999, &[]).unwrap_err();
        assert!(matches!(err, NetworkError::UnknownMessageType(999)));
    }

    #[test]
    fn test_last_registration_wins() {
        fn always_blob(body: &[u8]) -> Result<Box<dyn Message>> {
            Blob::decode(body)
        }

        let mut types = test_types();
        let before = types.len();
        types.register_with(Ping::TYPE_ID, always_blob);

        assert_eq!(types.len(), before);
        let decoded = types.decode(Ping::TYPE_ID, b"raw").unwrap();
        assert!(decoded.is::<Blob>());
    }

    #[test]
    fn test_response_shape() {
        let pong: Box<dyn Message> = Box::new(Pong::new(3, 0, "ok"));
        assert_eq!(pong.error_code(), Some(0));
        assert!(!pong.is_heartbeat());
        assert!(pong.downcast_ref::<Ping>().is_none());
    }
}
