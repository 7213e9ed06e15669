//! Zig-zag varint encoding for request ids.
//!
//! A signed value `n` is mapped to `(n << 1) ^ (n >> 63)` so that small
//! magnitudes of either sign encode to few bytes, then written as
//! little-endian base-128 groups with the high bit marking continuation.

use crate::error::ProtocolError;
use bytes::BufMut;

/// Maximum encoded length of a 64-bit varint.
pub const MAX_VARINT_LEN: usize = 10;

fn zigzag(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

fn unzigzag(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

/// Appends the minimal varint encoding of `value` to `buf`.
pub fn put_varint<B: BufMut>(buf: &mut B, value: i64) {
    let mut ux = zigzag(value);
    while ux >= 0x80 {
        buf.put_u8((ux as u8) | 0x80);
        ux >>= 7;
    }
    buf.put_u8(ux as u8);
}

/// Returns the number of bytes `put_varint` would write for `value`.
pub fn varint_len(value: i64) -> usize {
    let mut ux = zigzag(value);
    let mut len = 1;
    while ux >= 0x80 {
        ux >>= 7;
        len += 1;
    }
    len
}

/// Decodes a varint from the start of `buf` without consuming it.
///
/// Returns `Ok(Some((value, bytes_read)))` on success and `Ok(None)` if
/// `buf` ends before the final byte of the varint.
pub fn decode_varint(buf: &[u8]) -> Result<Option<(i64, usize)>, ProtocolError> {
    let mut ux: u64 = 0;
    let mut shift = 0u32;

    for (i, &byte) in buf.iter().enumerate() {
        if i == MAX_VARINT_LEN {
            return Err(ProtocolError::VarintOverflow);
        }
        if byte < 0x80 {
            if i == MAX_VARINT_LEN - 1 && byte > 1 {
                return Err(ProtocolError::VarintOverflow);
            }
            ux |= (byte as u64) << shift;
            return Ok(Some((unzigzag(ux), i + 1)));
        }
        ux |= ((byte & 0x7f) as u64) << shift;
        shift += 7;
    }

    if buf.len() >= MAX_VARINT_LEN {
        return Err(ProtocolError::VarintOverflow);
    }
    Ok(None)
}
