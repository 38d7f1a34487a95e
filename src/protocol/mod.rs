//! Protocol module - wire format, framing, and channel buffers.
//!
//! This module implements the binary packet protocol:
//! - 14-byte header encoding/decoding
//! - Receive buffer with a two-phase cursor for partial reads
//! - Send buffer that assembles one frame per outbound message
//! - Frame struct with typed accessors

mod frame;
mod receive_buffer;
mod send_buffer;
mod wire_format;

pub use frame::Frame;
pub use receive_buffer::{ReceiveBuffer, ReceiveCursor, DEFAULT_BUFFER_CAPACITY};
pub use send_buffer::SendBuffer;
pub use wire_format::{
    decode_header, encode_header, OperationType, PacketHeader, DEFAULT_MAX_BODY_SIZE, HEADER_SIZE,
};
