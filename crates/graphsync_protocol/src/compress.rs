//! lz4 payload compression.
//!
//! Payloads use the lz4 block format with the uncompressed length
//! prepended as a little-endian `u32`.

use crate::error::{ProtocolError, ProtocolResult};

/// Largest uncompressed payload accepted from the wire (16 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Compresses a payload.
pub fn compress(data: &[u8]) -> Vec<u8> {
    lz4_flex::compress_prepend_size(data)
}

/// Decompresses a payload produced by [`compress`].
///
/// The declared size is checked against [`MAX_PAYLOAD_SIZE`] before any
/// allocation happens.
pub fn decompress(data: &[u8]) -> ProtocolResult<Vec<u8>> {
    let header: [u8; 4] = data
        .get(..4)
        .and_then(|h| h.try_into().ok())
        .ok_or_else(|| ProtocolError::decompression("missing size prefix"))?;
    let declared = u32::from_le_bytes(header) as usize;
    if declared > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge {
            size: declared,
            limit: MAX_PAYLOAD_SIZE,
        });
    }

    lz4_flex::decompress_size_prepended(data)
        .map_err(|e| ProtocolError::decompression(e.to_string()))
}
