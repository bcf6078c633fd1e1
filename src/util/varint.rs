//! Variable-length integer encoding utilities.
//!
//! LEB128-style unsigned varints: 7 payload bits per byte, high bit set on
//! every byte except the last. Run records store term and document deltas
//! this way, so small gaps take a single byte.

use std::io;

/// Longest encoding of a `u64`.
pub const MAX_VARINT_LEN: usize = 10;

/// Append the encoding of `value` to `out`, returning the encoded length.
pub fn encode_u64_into(value: u64, out: &mut Vec<u8>) -> usize {
    let start = out.len();
    let mut val = value;

    loop {
        let mut byte = (val & 0x7F) as u8;
        val >>= 7;

        if val != 0 {
            byte |= 0x80; // Set continuation bit
        }

        out.push(byte);

        if val == 0 {
            break;
        }
    }

    out.len() - start
}

/// Decode a u64 value from the front of `bytes`.
///
/// Returns the value and the number of bytes consumed. Running out of input
/// mid-value yields `UnexpectedEof`; an encoding that does not fit in 64
/// bits yields `InvalidData`.
pub fn decode_u64(bytes: &[u8]) -> io::Result<(u64, usize)> {
    let mut result = 0u64;

    for (i, &byte) in bytes.iter().enumerate() {
        result |= accumulate(i, byte)?;

        if (byte & 0x80) == 0 {
            return Ok((result, i + 1));
        }
    }

    Err(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "incomplete varint",
    ))
}

fn accumulate(index: usize, byte: u8) -> io::Result<u64> {
    let payload = (byte & 0x7F) as u64;
    match index {
        0..=8 => Ok(payload << (7 * index)),
        // The tenth byte may only carry the single remaining bit.
        9 if byte <= 1 => Ok(payload << 63),
        _ => Err(overflow()),
    }
}

fn overflow() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, "varint overflows u64")
}
