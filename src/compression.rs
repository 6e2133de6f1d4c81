// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Transparent zstd compression for sealed payloads.
//!
//! Payloads at or above the configured threshold are compressed before they
//! enter an envelope. Magic-bytes detection lets decompression accept both
//! compressed and plain data, so a threshold change never invalidates
//! existing remote entries.

/// Zstd magic bytes (little-endian): 0xFD2FB528
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Default compression level (3 is a good balance of speed/ratio)
const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

/// Compression error types
#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    /// Failed to compress data
    #[error("compression failed: {0}")]
    CompressFailed(String),

    /// Failed to decompress data
    #[error("decompression failed: {0}")]
    DecompressFailed(String),
}

/// Check if data is zstd-compressed by checking magic bytes.
#[inline]
#[must_use]
pub fn is_compressed(data: &[u8]) -> bool {
    data.len() >= 4 && data[..4] == ZSTD_MAGIC
}

/// Compress bytes at the default level.
pub fn compress_bytes(data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    zstd::encode_all(data, DEFAULT_COMPRESSION_LEVEL)
        .map_err(|e| CompressionError::CompressFailed(e.to_string()))
}

/// Decompress bytes.
///
/// Returns the original bytes unchanged if they do not carry the zstd magic.
pub fn decompress_bytes(data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    if is_compressed(data) {
        zstd::decode_all(data).map_err(|e| CompressionError::DecompressFailed(e.to_string()))
    } else {
        Ok(data.to_vec())
    }
}
