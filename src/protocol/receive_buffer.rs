//! Receive buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management.
//! Implements a two-phase cursor for handling fragmented frames:
//! - `AwaitingHeader`: need `HEADER_SIZE` bytes
//! - `AwaitingBody`: header parsed, need `total_length - HEADER_SIZE` bytes
//!
//! The cursor only advances once the current target length is fully
//! buffered, so a stream split at arbitrary byte boundaries yields the same
//! frames as one delivered in a single read.

use bytes::{Buf, Bytes, BytesMut};

use super::wire_format::{PacketHeader, HEADER_SIZE};
use super::Frame;
use crate::error::Result;
use crate::handler::HeaderDeserializer;

/// Default initial capacity for channel buffers (64 KiB).
pub const DEFAULT_BUFFER_CAPACITY: usize = 64 * 1024;

/// Two-phase receive cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveCursor {
    /// Waiting for a complete header.
    AwaitingHeader,
    /// Header parsed, waiting for body bytes.
    AwaitingBody {
        /// The header that announced the body.
        header: PacketHeader,
    },
}

impl ReceiveCursor {
    /// Number of bytes this state needs before it can advance.
    #[inline]
    pub fn target_len(&self) -> usize {
        match self {
            ReceiveCursor::AwaitingHeader => HEADER_SIZE,
            ReceiveCursor::AwaitingBody { header } => header.body_length(),
        }
    }

    /// True when the awaited body has zero length.
    #[inline]
    pub fn is_empty_body(&self) -> bool {
        matches!(self, ReceiveCursor::AwaitingBody { .. }) && self.target_len() == 0
    }
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
pub struct ReceiveBuffer {
    /// Bytes read from the transport but not yet consumed.
    buffer: BytesMut,
    /// Current parsing state.
    cursor: ReceiveCursor,
}

impl ReceiveBuffer {
    /// Create a receive buffer with the default 64 KiB capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_CAPACITY)
    }

    /// Create a receive buffer with a custom initial capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
            cursor: ReceiveCursor::AwaitingHeader,
        }
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// Headers are parsed with the pipeline's `parser`. Partial data is kept
    /// for the next push.
    ///
    /// # Errors
    ///
    /// Returns the parser's error for a malformed header. The buffer should
    /// be discarded afterwards; there is no resynchronisation point.
    pub fn push(&mut self, data: &[u8], parser: &dyn HeaderDeserializer) -> Result<Vec<Frame>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_one(parser)? {
            frames.push(frame);
        }

        Ok(frames)
    }

    fn try_extract_one(&mut self, parser: &dyn HeaderDeserializer) -> Result<Option<Frame>> {
        loop {
            match self.cursor {
                ReceiveCursor::AwaitingHeader => {
                    if self.buffer.len() < HEADER_SIZE {
                        return Ok(None);
                    }

                    let header = parser.deserialize_header(&self.buffer[..HEADER_SIZE])?;
                    self.buffer.advance(HEADER_SIZE);
                    self.cursor = ReceiveCursor::AwaitingBody { header };

                    if self.cursor.is_empty_body() {
                        self.cursor = ReceiveCursor::AwaitingHeader;
                        return Ok(Some(Frame::new(header, Bytes::new())));
                    }
                }

                ReceiveCursor::AwaitingBody { header } => {
                    let body_length = header.body_length();
                    if self.buffer.len() < body_length {
                        return Ok(None);
                    }

                    let body = self.buffer.split_to(body_length).freeze();
                    self.cursor = ReceiveCursor::AwaitingHeader;
                    return Ok(Some(Frame::new(header, body)));
                }
            }
        }
    }

    /// Current cursor state.
    #[inline]
    pub fn cursor(&self) -> ReceiveCursor {
        self.cursor
    }

    /// Bytes buffered towards the current target, and the target itself.
    pub fn progress(&self) -> (usize, usize) {
        let target = self.cursor.target_len();
        (self.buffer.len().min(target), target)
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Clear the buffer and reset the cursor.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.cursor = ReceiveCursor::AwaitingHeader;
    }
}

impl Default for ReceiveBuffer {
    fn default() -> Self {
        Self::new()
    }
}
