//! Outbound packet assembly.
//!
//! Every packet is built in one pass over a channel-owned `BytesMut`:
//! reset, header (placeholder length until the body and compression outcome
//! are known), body, then `split().freeze()` so the finished frame can be
//! handed to the writer task as a single `Bytes`.

use bytes::{Bytes, BytesMut};

use super::receive_buffer::DEFAULT_BUFFER_CAPACITY;
use super::wire_format::{PacketHeader, HEADER_SIZE};
use crate::error::{NetworkError, Result};
use crate::handler::HandlerPipeline;
use crate::message::Message;

/// Growable buffer that assembles one outbound frame at a time.
pub struct SendBuffer {
    buffer: BytesMut,
}

impl SendBuffer {
    /// Create a send buffer with the default 64 KiB capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_CAPACITY)
    }

    /// Create a send buffer with a custom initial capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
        }
    }

    /// Serialize `message` through `pipeline` into a complete frame.
    ///
    /// # Errors
    ///
    /// Returns `MissingStrategy` when the pipeline lacks a serializer, the
    /// serializer's own error, or `Protocol` when the header's total length
    /// disagrees with the bytes actually written.
    pub fn build(&mut self, message: &dyn Message, pipeline: &HandlerPipeline) -> Result<Bytes> {
        self.buffer.clear();

        let result = self.write_frame(message, pipeline);
        if result.is_err() {
            self.buffer.clear();
        }
        result
    }

    fn write_frame(&mut self, message: &dyn Message, pipeline: &HandlerPipeline) -> Result<Bytes> {
        let header_serializer = pipeline.header_serializer()?;
        let body_serializer = pipeline.body_serializer()?;

        let body = header_serializer.serialize_header(message, pipeline.compressor(), &mut self.buffer)?;
        body_serializer.serialize_body(&body, &mut self.buffer)?;

        let header = PacketHeader::decode(&self.buffer)?;
        if header.total_length as usize != self.buffer.len() {
            return Err(NetworkError::Protocol(format!(
                "Header announces {} bytes but frame has {}",
                header.total_length,
                self.buffer.len()
            )));
        }
        debug_assert!(self.buffer.len() >= HEADER_SIZE);

        Ok(self.buffer.split().freeze())
    }

    /// Bytes currently reserved by the buffer.
    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }
}

impl Default for SendBuffer {
    fn default() -> Self {
        Self::new()
    }
}
