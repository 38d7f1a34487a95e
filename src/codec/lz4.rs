//! LZ4 body compression using `lz4_flex`.
//!
//! The uncompressed size is prepended to the compressed block
//! (`compress_prepend_size`), so decompression needs no side channel.

use lz4_flex::block::{decompress, uncompressed_size};
use lz4_flex::{compress_prepend_size, decompress_size_prepended};

use crate::error::{NetworkError, Result};

/// LZ4 block codec.
pub struct Lz4Codec;

impl Lz4Codec {
    /// Compress `data`, prefixing the original length.
    #[inline]
    pub fn compress(data: &[u8]) -> Vec<u8> {
        compress_prepend_size(data)
    }

    /// Decompress a block produced by [`Lz4Codec::compress`].
    ///
    /// # Errors
    ///
    /// Returns `Compression` if the block is truncated or corrupt.
    pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
        decompress_size_prepended(data).map_err(|e| NetworkError::Compression(e.to_string()))
    }

    /// Decompress a block whose declared size is at most `max_len` bytes.
    ///
    /// The size prefix is checked before anything is allocated.
    ///
    /// # Errors
    ///
    /// Returns `Protocol` if the declared size exceeds `max_len`, and
    /// `Compression` if the block is truncated or corrupt.
    pub fn decompress_bounded(data: &[u8], max_len: usize) -> Result<Vec<u8>> {
        let (size, block) =
            uncompressed_size(data).map_err(|e| NetworkError::Compression(e.to_string()))?;
        if size > max_len {
            return Err(NetworkError::Protocol(format!(
                "Decompressed body size {} exceeds maximum {}",
                size, max_len
            )));
        }
        decompress(block, size).map_err(|e| NetworkError::Compression(e.to_string()))
    }
}
