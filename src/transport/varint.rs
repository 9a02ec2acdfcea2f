//! Base-128 varints used for chunk indices and the total frame length.
//!
//! Seven bits per byte, least significant group first, 0x80 marks a
//! continuation. Decoders accept at most four bytes.

use crate::core::{MAX_VARINT_SIZE, ProtocolError};

/// Append the varint encoding of `value` to `out`.
pub fn encode_into(mut value: u32, out: &mut Vec<u8>) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Encode `value` as a varint.
pub fn encode(value: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(MAX_VARINT_SIZE);
    encode_into(value, &mut out);
    out
}

/// Decode a varint starting at `pos`.
///
/// Returns the value and the position just past it. Running out of input or
/// needing a fifth byte fails with [`ProtocolError::Format`].
pub fn decode(data: &[u8], pos: usize) -> Result<(u32, usize), ProtocolError> {
    let mut value: u32 = 0;
    for offset in 0..MAX_VARINT_SIZE {
        let byte = *data.get(pos + offset).ok_or(ProtocolError::Format)?;
        value |= u32::from(byte & 0x7F) << (offset * 7);
        if byte & 0x80 == 0 {
            return Ok((value, pos + offset + 1));
        }
    }
    Err(ProtocolError::Format)
}
