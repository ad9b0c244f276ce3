//! Transparent payload compression.
//!
//! Stored records are zstd-compressed when compression is enabled. A zstd
//! frame is self-describing (it starts with the frame magic), so reads need
//! no external state: `decompress` inspects the leading bytes and passes
//! non-compressed records through untouched.

use amphora_common::Result;
use std::io::Write;

/// Leading bytes of a zstd frame.
const ZSTD_FRAME_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

/// Default compression level.
const LEVEL: i32 = 3;

/// Compress a record.
pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = zstd::stream::Encoder::new(Vec::with_capacity(data.len() / 2), LEVEL)?;
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Undo `compress`. Data that does not start with a zstd frame is returned
/// as-is.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    if !is_compressed(data) {
        return Ok(data.to_vec());
    }
    zstd::stream::decode_all(data).map_err(Into::into)
}

/// Check whether a record is a zstd frame.
#[must_use]
pub fn is_compressed(data: &[u8]) -> bool {
    data.len() >= 4 && data[0..4] == ZSTD_FRAME_MAGIC
}
