//! Default strategies for every pipeline capability.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

use super::pipeline::{
    BodyDeserializer, BodySerializer, Compressor, Decompressor, HeaderDeserializer,
    HeaderSerializer, HeartbeatBuilder,
};
use crate::codec::Lz4Codec;
use crate::error::{NetworkError, Result};
use crate::message::{Heartbeat, Message, MessageTypes};
use crate::protocol::{OperationType, PacketHeader, DEFAULT_MAX_BODY_SIZE, HEADER_SIZE};

/// Bodies longer than this many bytes are compressed by default.
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 512;

/// Writes the 14-byte header and decides compression.
#[derive(Debug, Clone, Copy)]
pub struct PacketHeaderSerializer {
    compression_threshold: usize,
}

impl PacketHeaderSerializer {
    /// Create a serializer that compresses bodies longer than `compression_threshold`.
    pub fn new(compression_threshold: usize) -> Self {
        Self {
            compression_threshold,
        }
    }
}

impl Default for PacketHeaderSerializer {
    fn default() -> Self {
        Self::new(DEFAULT_COMPRESSION_THRESHOLD)
    }
}

impl HeaderSerializer for PacketHeaderSerializer {
    fn serialize_header(
        &self,
        message: &dyn Message,
        compressor: Option<&dyn Compressor>,
        destination: &mut BytesMut,
    ) -> Result<Bytes> {
        // Placeholder until the final body length is known.
        let start = destination.len();
        destination.put_bytes(0, HEADER_SIZE);

        let mut body = message.encode()?;
        let mut compressed = false;
        if let Some(compressor) = compressor {
            if body.len() > self.compression_threshold {
                let raw_len = body.len();
                body = compressor.compress(&body)?;
                compressed = true;
                trace!(raw_len, wire_len = body.len(), "Compressed body");
            }
        }

        let total_length = u32::try_from(HEADER_SIZE + body.len()).map_err(|_| {
            NetworkError::Protocol(format!("Body of {} bytes does not fit a frame", body.len()))
        })?;
        let operation = match (message.is_heartbeat(), message.is_heartbeat_ack()) {
            (true, true) => OperationType::HeartbeatAck,
            (true, false) => OperationType::Heartbeat,
            (false, _) => OperationType::Message,
        };

        PacketHeader::new(
            total_length,
            operation,
            compressed,
            message.unique_id(),
            message.message_type_id(),
        )
        .encode_into(&mut destination[start..start + HEADER_SIZE]);

        Ok(Bytes::from(body))
    }
}

/// Appends body bytes verbatim.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawBodySerializer;

impl BodySerializer for RawBodySerializer {
    fn serialize_body(&self, body: &[u8], destination: &mut BytesMut) -> Result<()> {
        destination.extend_from_slice(body);
        Ok(())
    }
}

/// Parses the 14-byte header and enforces a body size limit.
#[derive(Debug, Clone, Copy)]
pub struct PacketHeaderDeserializer {
    max_body_size: u32,
}

impl PacketHeaderDeserializer {
    /// Create a deserializer that rejects bodies over `max_body_size` bytes.
    pub fn new(max_body_size: u32) -> Self {
        Self { max_body_size }
    }
}

impl Default for PacketHeaderDeserializer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BODY_SIZE)
    }
}

impl HeaderDeserializer for PacketHeaderDeserializer {
    fn deserialize_header(&self, source: &[u8]) -> Result<PacketHeader> {
        let header = PacketHeader::decode(source)?;
        header.validate(self.max_body_size)?;
        Ok(header)
    }
}

/// Looks the type id up in a [`MessageTypes`] table.
#[derive(Debug, Clone, Default)]
pub struct MessageBodyDeserializer {
    types: MessageTypes,
}

impl MessageBodyDeserializer {
    /// Create a deserializer over `types`.
    pub fn new(types: MessageTypes) -> Self {
        Self { types }
    }
}

impl BodyDeserializer for MessageBodyDeserializer {
    fn deserialize_body(&self, source: &[u8], message_type_id: u32) -> Result<Box<dyn Message>> {
        self.types.decode(message_type_id, source)
    }
}

/// LZ4 in both directions.
///
/// Decompression rejects blocks that declare more than
/// `max_decompressed_size` bytes of output.
#[derive(Debug, Clone, Copy)]
pub struct Lz4Compressor {
    max_decompressed_size: usize,
}

impl Lz4Compressor {
    /// Create a codec that inflates bodies up to `max_decompressed_size` bytes.
    pub fn new(max_decompressed_size: usize) -> Self {
        Self {
            max_decompressed_size,
        }
    }
}

impl Default for Lz4Compressor {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BODY_SIZE as usize)
    }
}

impl Compressor for Lz4Compressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(Lz4Codec::compress(data))
    }
}

impl Decompressor for Lz4Compressor {
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Lz4Codec::decompress_bounded(data, self.max_decompressed_size)
    }
}

/// Sends the built-in [`Heartbeat`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultHeartbeatBuilder;

impl HeartbeatBuilder for DefaultHeartbeatBuilder {
    fn build_heartbeat(&self) -> Box<dyn Message> {
        Box::new(Heartbeat::new())
    }
}
