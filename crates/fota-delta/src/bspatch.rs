//! Three-stream delta application
//!
//! A block delta is a sequence of control triples `(diff_len, extra_len,
//! seek_adjust)`. For each triple, `diff_len` bytes from the diff stream are
//! added (mod 256) to the old bytes at the current old position, then
//! `extra_len` bytes are copied verbatim from the extra stream, and the old
//! position moves by `seek_adjust`.

use crate::error::{PatchError, PatchResult};
use std::io::Read;
use tracing::trace;

/// Encoded size of one control value
pub const CONTROL_VALUE_SIZE: usize = 8;

/// Decode a sign-magnitude 64-bit integer (bsdiff `offtin`).
///
/// Bytes 0-6 and the low seven bits of byte 7 hold the magnitude in
/// little-endian order, bit 7 of byte 7 is the sign.
pub fn offtin(buf: [u8; 8]) -> i64 {
    let mut magnitude = buf;
    magnitude[7] &= 0x7F;
    let magnitude = i64::from_le_bytes(magnitude);
    if buf[7] & 0x80 == 0 {
        magnitude
    } else {
        -magnitude
    }
}

/// Encode a signed 64-bit integer as sign-magnitude (bsdiff `offtout`).
pub fn offtout(value: i64) -> [u8; 8] {
    let mut buf = value.unsigned_abs().to_le_bytes();
    buf[7] &= 0x7F;
    if value < 0 {
        buf[7] |= 0x80;
    }
    buf
}

/// One decoded control instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlTriple {
    /// Bytes reconstructed by adding diff bytes to old bytes
    pub diff_len: i64,
    /// Bytes copied verbatim from the extra stream
    pub extra_len: i64,
    /// Signed adjustment of the old position after the extra copy
    pub seek_adjust: i64,
}

impl ControlTriple {
    /// Create a new control triple
    pub fn new(diff_len: i64, extra_len: i64, seek_adjust: i64) -> Self {
        Self {
            diff_len,
            extra_len,
            seek_adjust,
        }
    }

    /// Read a triple from the control stream
    pub fn read_from<R: Read>(ctrl: &mut R) -> PatchResult<Self> {
        let mut values = [0i64; 3];
        for value in &mut values {
            let mut buf = [0u8; CONTROL_VALUE_SIZE];
            ctrl.read_exact(&mut buf)
                .map_err(|e| PatchError::from_stream_read("control stream", &e))?;
            *value = offtin(buf);
        }
        Ok(Self::new(values[0], values[1], values[2]))
    }

    /// Encode this triple as 24 control bytes
    pub fn to_bytes(&self) -> [u8; 3 * CONTROL_VALUE_SIZE] {
        let mut out = [0u8; 3 * CONTROL_VALUE_SIZE];
        out[..8].copy_from_slice(&offtout(self.diff_len));
        out[8..16].copy_from_slice(&offtout(self.extra_len));
        out[16..].copy_from_slice(&offtout(self.seek_adjust));
        out
    }
}

/// Check that `len` more bytes fit between `pos` and `new_size`
fn checked_span(pos: usize, len: i64, new_size: usize, what: &str) -> PatchResult<usize> {
    let len = usize::try_from(len)
        .map_err(|_| PatchError::corrupt_patch(format!("negative {what} length {len}")))?;
    match pos.checked_add(len) {
        Some(end) if end <= new_size => Ok(len),
        _ => Err(PatchError::corrupt_patch(format!(
            "{what} of {len} bytes at offset {pos} overruns block of {new_size} bytes"
        ))),
    }
}

/// Rebuild a block of `new_size` bytes from `old` and the three delta streams.
///
/// `old` may be empty. Old positions outside `old` contribute nothing, the
/// diff byte is taken as is. Control data left over once `new_size` bytes are
/// produced is ignored.
pub fn apply<C, D, E>(
    old: &[u8],
    new_size: usize,
    ctrl: &mut C,
    diff: &mut D,
    extra: &mut E,
) -> PatchResult<Vec<u8>>
where
    C: Read,
    D: Read,
    E: Read,
{
    let mut new = vec![0u8; new_size];
    let mut old_pos: i64 = 0;
    let mut new_pos: usize = 0;

    while new_pos < new_size {
        let triple = ControlTriple::read_from(ctrl)?;
        trace!(
            diff_len = triple.diff_len,
            extra_len = triple.extra_len,
            seek_adjust = triple.seek_adjust,
            new_pos,
            old_pos,
            "Control triple"
        );

        let diff_len = checked_span(new_pos, triple.diff_len, new_size, "diff")?;
        let target = &mut new[new_pos..new_pos + diff_len];
        diff.read_exact(target)
            .map_err(|e| PatchError::from_stream_read("diff stream", &e))?;

        for (j, byte) in target.iter_mut().enumerate() {
            let pos = old_pos.wrapping_add(j as i64);
            if let Some(old_byte) = usize::try_from(pos).ok().and_then(|p| old.get(p)) {
                *byte = byte.wrapping_add(*old_byte);
            }
        }
        new_pos += diff_len;
        old_pos = old_pos.wrapping_add(diff_len as i64);

        let extra_len = checked_span(new_pos, triple.extra_len, new_size, "extra")?;
        extra
            .read_exact(&mut new[new_pos..new_pos + extra_len])
            .map_err(|e| PatchError::from_stream_read("extra stream", &e))?;
        new_pos += extra_len;
        old_pos = old_pos.wrapping_add(triple.seek_adjust);
    }

    Ok(new)
}
