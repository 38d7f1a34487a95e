//! Frame struct with typed accessors.
//!
//! Represents one header-plus-body unit read off the wire.
//! Uses `bytes::Bytes` for zero-copy body sharing.
//!
//! # Example
//!
//! ```
//! use tickwire::protocol::{Frame, OperationType, PacketHeader, HEADER_SIZE};
//! use bytes::Bytes;
//!
//! let header = PacketHeader::new(HEADER_SIZE as u32 + 5, OperationType::Message, false, 42, 7);
//! let frame = Frame::new(header, Bytes::from_static(b"hello"));
//!
//! assert_eq!(frame.unique_id(), 42);
//! assert_eq!(frame.body(), b"hello");
//! ```

use bytes::Bytes;

use super::wire_format::{PacketHeader, HEADER_SIZE};

/// A complete protocol frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Decoded header.
    pub header: PacketHeader,
    /// Body bytes exactly as received (possibly compressed).
    pub body: Bytes,
}

impl Frame {
    /// Create a new frame from header and body.
    pub fn new(header: PacketHeader, body: Bytes) -> Self {
        Self { header, body }
    }

    /// Get a reference to the body bytes.
    #[inline]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Get the unique (correlation) id.
    #[inline]
    pub fn unique_id(&self) -> u32 {
        self.header.unique_id
    }

    /// Get the message type id.
    #[inline]
    pub fn message_type_id(&self) -> u32 {
        self.header.message_type_id
    }

    /// Check if the body is compressed.
    #[inline]
    pub fn is_compressed(&self) -> bool {
        self.header.compressed
    }

    /// Check if this is a heartbeat request.
    #[inline]
    pub fn is_heartbeat(&self) -> bool {
        self.header.is_heartbeat()
    }

    /// Check if this answers a heartbeat request.
    #[inline]
    pub fn is_heartbeat_ack(&self) -> bool {
        self.header.is_heartbeat_ack()
    }

    /// Size of this frame on the wire.
    #[inline]
    pub fn wire_len(&self) -> usize {
        HEADER_SIZE + self.body.len()
    }
}
