//! Strategy traits and the pipeline that bundles them.
//!
//! A [`HandlerPipeline`] holds at most one active strategy per
//! [`Capability`]. Strategies are stateless with respect to any single
//! channel, so one pipeline is shared (`Arc`) by every channel built from it.

use std::fmt;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tracing::debug;

use super::defaults::{
    DefaultHeartbeatBuilder, Lz4Compressor, MessageBodyDeserializer, PacketHeaderDeserializer,
    PacketHeaderSerializer, RawBodySerializer, DEFAULT_COMPRESSION_THRESHOLD,
};
use crate::error::{Capability, NetworkError, Result};
use crate::message::{Heartbeat, Message, MessageTypes};
use crate::protocol::{PacketHeader, DEFAULT_MAX_BODY_SIZE};

/// Writes the packet header and returns the body to append after it.
pub trait HeaderSerializer: Send + Sync {
    /// Write the 14-byte header for `message` into `destination` and return
    /// the body as it must appear on the wire.
    ///
    /// The body is compressed only when `compressor` is present and the
    /// serialized body is longer than the configured threshold.
    fn serialize_header(
        &self,
        message: &dyn Message,
        compressor: Option<&dyn Compressor>,
        destination: &mut BytesMut,
    ) -> Result<Bytes>;
}

/// Appends body bytes to the send buffer.
pub trait BodySerializer: Send + Sync {
    /// Append `body` to `destination`.
    fn serialize_body(&self, body: &[u8], destination: &mut BytesMut) -> Result<()>;
}

/// Parses and validates an inbound header.
pub trait HeaderDeserializer: Send + Sync {
    /// Parse the first 14 bytes of `source`.
    fn deserialize_header(&self, source: &[u8]) -> Result<PacketHeader>;
}

/// Materializes a message from (decompressed) body bytes.
pub trait BodyDeserializer: Send + Sync {
    /// Decode `source` as the type registered under `message_type_id`.
    fn deserialize_body(&self, source: &[u8], message_type_id: u32) -> Result<Box<dyn Message>>;
}

/// Compresses outbound bodies.
pub trait Compressor: Send + Sync {
    /// Compress `data`.
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// Decompresses inbound bodies.
pub trait Decompressor: Send + Sync {
    /// Decompress `data`.
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// Builds the heartbeat request and its acknowledgement.
pub trait HeartbeatBuilder: Send + Sync {
    /// Create the message sent when a heartbeat interval elapses.
    fn build_heartbeat(&self) -> Box<dyn Message>;

    /// Create the message sent back when a peer's heartbeat arrives. Must be
    /// heartbeat-shaped with [`Message::is_heartbeat_ack`] set.
    fn build_heartbeat_ack(&self) -> Box<dyn Message> {
        Box::new(Heartbeat::ack())
    }
}

/// Tunables for the default strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Bodies strictly longer than this are compressed (bytes).
    pub compression_threshold: usize,
    /// Largest inbound body accepted (bytes), both on the wire and after
    /// decompression.
    pub max_body_size: u32,
}

impl PipelineConfig {
    /// Set the compression threshold.
    pub fn with_compression_threshold(mut self, threshold: usize) -> Self {
        self.compression_threshold = threshold;
        self
    }

    /// Set the maximum inbound body size.
    pub fn with_max_body_size(mut self, max_body_size: u32) -> Self {
        self.max_body_size = max_body_size;
        self
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }
}

/// Registration table with one active strategy per capability.
///
/// Every `with_*` call replaces the previous strategy for that capability
/// (last registration wins), so hosts override only what they need:
///
/// ```
/// use tickwire::handler::{Compressor, HandlerPipeline};
/// use tickwire::message::MessageTypes;
///
/// struct Identity;
///
/// impl Compressor for Identity {
///     fn compress(&self, data: &[u8]) -> tickwire::Result<Vec<u8>> {
///         Ok(data.to_vec())
///     }
/// }
///
/// let pipeline = HandlerPipeline::with_defaults(MessageTypes::new()).with_compressor(Identity);
/// assert!(pipeline.compressor().is_some());
/// ```
#[derive(Clone, Default)]
pub struct HandlerPipeline {
    header_serializer: Option<Arc<dyn HeaderSerializer>>,
    body_serializer: Option<Arc<dyn BodySerializer>>,
    header_deserializer: Option<Arc<dyn HeaderDeserializer>>,
    body_deserializer: Option<Arc<dyn BodyDeserializer>>,
    compressor: Option<Arc<dyn Compressor>>,
    decompressor: Option<Arc<dyn Decompressor>>,
    heartbeat_builder: Option<Arc<dyn HeartbeatBuilder>>,
}

impl HandlerPipeline {
    /// Create an empty pipeline. Every capability is missing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a pipeline with all seven default strategies.
    pub fn with_defaults(types: MessageTypes) -> Self {
        Self::with_config(types, PipelineConfig::default())
    }

    /// Create a pipeline with the default strategies tuned by `config`.
    pub fn with_config(types: MessageTypes, config: PipelineConfig) -> Self {
        Self::new()
            .with_header_serializer(PacketHeaderSerializer::new(config.compression_threshold))
            .with_body_serializer(RawBodySerializer)
            .with_header_deserializer(PacketHeaderDeserializer::new(config.max_body_size))
            .with_body_deserializer(MessageBodyDeserializer::new(types))
            .with_compressor(Lz4Compressor::new(config.max_body_size as usize))
            .with_decompressor(Lz4Compressor::new(config.max_body_size as usize))
            .with_heartbeat_builder(DefaultHeartbeatBuilder)
    }

    /// Register the header serializer.
    pub fn with_header_serializer(mut self, strategy: impl HeaderSerializer + 'static) -> Self {
        install(&mut self.header_serializer, Arc::new(strategy), Capability::SerializeHeader);
        self
    }

    /// Register the body serializer.
    pub fn with_body_serializer(mut self, strategy: impl BodySerializer + 'static) -> Self {
        install(&mut self.body_serializer, Arc::new(strategy), Capability::SerializeBody);
        self
    }

    /// Register the header deserializer.
    pub fn with_header_deserializer(mut self, strategy: impl HeaderDeserializer + 'static) -> Self {
        install(&mut self.header_deserializer, Arc::new(strategy), Capability::DeserializeHeader);
        self
    }

    /// Register the body deserializer.
    pub fn with_body_deserializer(mut self, strategy: impl BodyDeserializer + 'static) -> Self {
        install(&mut self.body_deserializer, Arc::new(strategy), Capability::DeserializeBody);
        self
    }

    /// Register the compressor.
    pub fn with_compressor(mut self, strategy: impl Compressor + 'static) -> Self {
        install(&mut self.compressor, Arc::new(strategy), Capability::Compress);
        self
    }

    /// Remove the compressor. Outbound bodies are then never compressed.
    pub fn without_compressor(mut self) -> Self {
        self.compressor = None;
        self
    }

    /// Register the decompressor.
    pub fn with_decompressor(mut self, strategy: impl Decompressor + 'static) -> Self {
        install(&mut self.decompressor, Arc::new(strategy), Capability::Decompress);
        self
    }

    /// Register the heartbeat builder.
    pub fn with_heartbeat_builder(mut self, strategy: impl HeartbeatBuilder + 'static) -> Self {
        install(&mut self.heartbeat_builder, Arc::new(strategy), Capability::BuildHeartbeat);
        self
    }

    /// Active header serializer.
    pub fn header_serializer(&self) -> Result<&dyn HeaderSerializer> {
        require(self.header_serializer.as_deref(), Capability::SerializeHeader)
    }

    /// Active body serializer.
    pub fn body_serializer(&self) -> Result<&dyn BodySerializer> {
        require(self.body_serializer.as_deref(), Capability::SerializeBody)
    }

    /// Active header deserializer.
    pub fn header_deserializer(&self) -> Result<&dyn HeaderDeserializer> {
        require(self.header_deserializer.as_deref(), Capability::DeserializeHeader)
    }

    /// Active body deserializer.
    pub fn body_deserializer(&self) -> Result<&dyn BodyDeserializer> {
        require(self.body_deserializer.as_deref(), Capability::DeserializeBody)
    }

    /// Active compressor. Optional: absence disables compression.
    pub fn compressor(&self) -> Option<&dyn Compressor> {
        self.compressor.as_deref()
    }

    /// Active decompressor. Needed only when a compressed frame arrives.
    pub fn decompressor(&self) -> Result<&dyn Decompressor> {
        require(self.decompressor.as_deref(), Capability::Decompress)
    }

    /// Active heartbeat builder. Needed only when heartbeats are enabled.
    pub fn heartbeat_builder(&self) -> Result<&dyn HeartbeatBuilder> {
        require(self.heartbeat_builder.as_deref(), Capability::BuildHeartbeat)
    }

    /// Check whether a strategy is registered for `capability`.
    pub fn has(&self, capability: Capability) -> bool {
        match capability {
            Capability::SerializeHeader => self.header_serializer.is_some(),
            Capability::SerializeBody => self.body_serializer.is_some(),
            Capability::DeserializeHeader => self.header_deserializer.is_some(),
            Capability::DeserializeBody => self.body_deserializer.is_some(),
            Capability::Compress => self.compressor.is_some(),
            Capability::Decompress => self.decompressor.is_some(),
            Capability::BuildHeartbeat => self.heartbeat_builder.is_some(),
        }
    }
}

fn install<T: ?Sized>(slot: &mut Option<Arc<T>>, strategy: Arc<T>, capability: Capability) {
    if slot.replace(strategy).is_some() {
        debug!(%capability, "Replaced pipeline strategy");
    }
}

fn require<T: ?Sized>(strategy: Option<&T>, capability: Capability) -> Result<&T> {
    strategy.ok_or(NetworkError::MissingStrategy(capability))
}

impl fmt::Debug for HandlerPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const ALL: [Capability; 7] = [
            Capability::SerializeHeader,
            Capability::SerializeBody,
            Capability::DeserializeHeader,
            Capability::DeserializeBody,
            Capability::Compress,
            Capability::Decompress,
            Capability::BuildHeartbeat,
        ];
        let registered: Vec<Capability> = ALL.into_iter().filter(|c| self.has(*c)).collect();
        f.debug_struct("HandlerPipeline")
            .field("registered", &registered)
            .finish()
    }
}
