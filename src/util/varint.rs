//! Variable-length integer encoding utilities.
//!
//! Unsigned LEB128 (7 bits per byte with a continuation bit) for `u32`
//! values, the encoding used for the term deltas and doc ids in posting
//! blocks and for the segment doc sketches. Everything wider in the on-disk
//! formats is fixed-width little-endian.

use crate::error::{Result, SwiftletError};

/// Maximum encoded length of a `u32`.
pub const MAX_VARINT32_LEN: usize = 5;

/// Encode a u32 value into a buffer, returning the number of bytes written.
pub fn encode_u32(buf: &mut Vec<u8>, value: u32) -> usize {
    let mut val = value;
    let mut len = 0;

    loop {
        let mut byte = (val & 0x7F) as u8;
        val >>= 7;

        if val != 0 {
            byte |= 0x80; // Set continuation bit
        }

        buf.push(byte);
        len += 1;

        if val == 0 {
            break;
        }
    }

    len
}

/// Number of bytes `encode_u32` would emit for a value.
pub fn encoded_len_u32(value: u32) -> usize {
    match value {
        0..=0x7F => 1,
        0x80..=0x3FFF => 2,
        0x4000..=0x1F_FFFF => 3,
        0x20_0000..=0xFFF_FFFF => 4,
        _ => 5,
    }
}

/// Decode a u32 value from a byte slice, returning `(value, bytes_read)`.
pub fn decode_u32(bytes: &[u8]) -> Result<(u32, usize)> {
    let mut result = 0u32;
    let mut shift = 0;
    let mut bytes_read = 0;

    for &byte in bytes {
        bytes_read += 1;

        if shift >= 32 {
            return Err(SwiftletError::storage("varint overflow"));
        }

        result |= ((byte & 0x7F) as u32) << shift;

        if (byte & 0x80) == 0 {
            return Ok((result, bytes_read));
        }

        shift += 7;
    }

    Err(SwiftletError::storage("incomplete varint"))
}
