//! Wire format encoding and decoding.
//!
//! Implements the 14-byte packet header:
//! ```text
//! ┌──────────────┬─────────┬────────────┬───────────┬─────────────────┐
//! │ Total Length │ Op Type │ Compressed │ Unique ID │ Message Type ID │
//! │ 4 bytes      │ 1 byte  │ 1 byte     │ 4 bytes   │ 4 bytes         │
//! │ uint32 BE    │         │ 0 or 1     │ uint32 BE │ uint32 BE       │
//! └──────────────┴─────────┴────────────┴───────────┴─────────────────┘
//! ```
//!
//! `Total Length` covers the header plus the body exactly as written on the
//! wire (after compression). All multi-byte integers are Big Endian.

use crate::error::{NetworkError, Result};

/// Header size in bytes (fixed, exactly 14).
pub const HEADER_SIZE: usize = 14;

/// Default maximum body size accepted from the wire (16 MiB).
pub const DEFAULT_MAX_BODY_SIZE: u32 = 16 * 1024 * 1024;

/// Kind of packet carried by a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OperationType {
    /// Heartbeat request.
    Heartbeat = 1,
    /// Answer to a heartbeat request. Never answered itself.
    HeartbeatAck = 2,
    /// Application message.
    Message = 4,
}

impl OperationType {
    /// Wire value of this operation type.
    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for OperationType {
    type Error = NetworkError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(OperationType::Heartbeat),
            2 => Ok(OperationType::HeartbeatAck),
            4 => Ok(OperationType::Message),
            other => Err(NetworkError::Protocol(format!(
                "Unknown operation type {}",
                other
            ))),
        }
    }
}

/// Decoded packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Header length plus on-wire body length.
    pub total_length: u32,
    /// Heartbeat or application message.
    pub operation: OperationType,
    /// Whether the body on the wire is compressed.
    pub compressed: bool,
    /// Request/response correlation id.
    pub unique_id: u32,
    /// Schema id of the application payload.
    pub message_type_id: u32,
}

impl PacketHeader {
    /// Create a new header.
    pub fn new(
        total_length: u32,
        operation: OperationType,
        compressed: bool,
        unique_id: u32,
        message_type_id: u32,
    ) -> Self {
        Self {
            total_length,
            operation,
            compressed,
            unique_id,
            message_type_id,
        }
    }

    /// Length of the body that follows the header.
    ///
    /// Saturates at zero for headers that were never validated.
    #[inline]
    pub fn body_length(&self) -> usize {
        (self.total_length as usize).saturating_sub(HEADER_SIZE)
    }

    /// Encode header to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use tickwire::protocol::{OperationType, PacketHeader, HEADER_SIZE};
    ///
    /// let header = PacketHeader::new(20, OperationType::Message, false, 7, 1001);
    /// let bytes = header.encode();
    /// assert_eq!(bytes.len(), HEADER_SIZE);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode header into the first `HEADER_SIZE` bytes of `buf`.
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than `HEADER_SIZE` (14 bytes).
    pub fn encode_into(&self, buf: &mut [u8]) {
        assert!(buf.len() >= HEADER_SIZE, "header buffer too short");
        buf[0..4].copy_from_slice(&self.total_length.to_be_bytes());
        buf[4] = self.operation.as_u8();
        buf[5] = u8::from(self.compressed);
        buf[6..10].copy_from_slice(&self.unique_id.to_be_bytes());
        buf[10..14].copy_from_slice(&self.message_type_id.to_be_bytes());
    }

    /// Decode header from bytes (Big Endian).
    ///
    /// Rejects short buffers, unknown operation types and compressed flags
    /// other than 0 or 1.
    ///
    /// # Example
    ///
    /// ```
    /// use tickwire::protocol::{OperationType, PacketHeader};
    ///
    /// let bytes = [0, 0, 0, 20, 4, 1, 0, 0, 0, 7, 0, 0, 3, 0xE9];
    /// let header = PacketHeader::decode(&bytes).unwrap();
    /// assert_eq!(header.total_length, 20);
    /// assert_eq!(header.operation, OperationType::Message);
    /// assert!(header.compressed);
    /// assert_eq!(header.unique_id, 7);
    /// assert_eq!(header.message_type_id, 1001);
    /// ```
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(NetworkError::Protocol(format!(
                "Header needs {} bytes, got {}",
                HEADER_SIZE,
                buf.len()
            )));
        }

        let compressed = match buf[5] {
            0 => false,
            1 => true,
            other => {
                return Err(NetworkError::Protocol(format!(
                    "Invalid compressed flag {}",
                    other
                )))
            }
        };

        Ok(Self {
            total_length: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            operation: OperationType::try_from(buf[4])?,
            compressed,
            unique_id: u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]),
            message_type_id: u32::from_be_bytes([buf[10], buf[11], buf[12], buf[13]]),
        })
    }

    /// Validate the length fields.
    ///
    /// Checks:
    /// - Total length covers at least the header itself
    /// - Body length doesn't exceed `max_body_size`
    pub fn validate(&self, max_body_size: u32) -> Result<()> {
        if (self.total_length as usize) < HEADER_SIZE {
            return Err(NetworkError::Protocol(format!(
                "Total length {} is shorter than the header",
                self.total_length
            )));
        }

        if self.body_length() > max_body_size as usize {
            return Err(NetworkError::Protocol(format!(
                "Body size {} exceeds maximum {}",
                self.body_length(),
                max_body_size
            )));
        }

        Ok(())
    }

    /// Check if this is a heartbeat request.
    #[inline]
    pub fn is_heartbeat(&self) -> bool {
        self.operation == OperationType::Heartbeat
    }

    /// Check if this answers a heartbeat request.
    #[inline]
    pub fn is_heartbeat_ack(&self) -> bool {
        self.operation == OperationType::HeartbeatAck
    }
}

/// Encode a header from its fields (standalone function).
#[inline]
pub fn encode_header(
    total_length: u32,
    operation: OperationType,
    compressed: bool,
    unique_id: u32,
    message_type_id: u32,
) -> [u8; HEADER_SIZE] {
    PacketHeader::new(total_length, operation, compressed, unique_id, message_type_id).encode()
}

/// Decode a header from bytes (standalone function).
#[inline]
pub fn decode_header(buf: &[u8]) -> Result<PacketHeader> {
    PacketHeader::decode(buf)
}
