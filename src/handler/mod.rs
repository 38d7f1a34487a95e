//! Handler module - the pluggable strategy pipeline and inbound routing.
//!
//! Provides:
//! - [`HandlerPipeline`] - one active strategy per capability (serialize
//!   header/body, deserialize header/body, compress, decompress, heartbeat)
//! - default strategies used by [`HandlerPipeline::with_defaults`]
//! - [`MessageRouter`] - dispatches non-RPC inbound messages by type id
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use tickwire::handler::{HandlerPipeline, PipelineConfig};
//! use tickwire::message::MessageTypes;
//!
//! let config = PipelineConfig::default().with_compression_threshold(1024);
//! let pipeline = Arc::new(HandlerPipeline::with_config(MessageTypes::new(), config));
//! assert!(pipeline.header_serializer().is_ok());
//! ```

mod defaults;
mod pipeline;
mod router;

pub use defaults::{
    DefaultHeartbeatBuilder, Lz4Compressor, MessageBodyDeserializer, PacketHeaderDeserializer,
    PacketHeaderSerializer, RawBodySerializer, DEFAULT_COMPRESSION_THRESHOLD,
};
pub use pipeline::{
    BodyDeserializer, BodySerializer, Compressor, Decompressor, HandlerPipeline,
    HeaderDeserializer, HeaderSerializer, HeartbeatBuilder, PipelineConfig,
};
pub use router::{typed, MessageHandler, MessageRouter};
