//! CRC-32 helpers
//!
//! The patch format uses the zlib CRC-32 (IEEE 802.3 polynomial). A CRC can be
//! folded across chunks by feeding the previous value back in as the seed, so
//! reading a file in pieces yields the same value as hashing it in one pass.

use std::io::Read;

/// Default chunk size used when folding a CRC over a stream
pub const CRC_BLOCKSIZE: usize = 4096;

/// Continue a CRC-32 computation over `bytes`, starting from `seed`.
///
/// `crc32(0, data)` is the plain checksum of `data`.
pub fn crc32(seed: u32, bytes: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new_with_initial(seed);
    hasher.update(bytes);
    hasher.finalize()
}

/// Compute the CRC-32 of everything `reader` yields, `chunk_size` bytes at a time.
///
/// Returns the checksum together with the number of bytes consumed.
pub fn crc32_stream<R: Read>(reader: &mut R, chunk_size: usize) -> std::io::Result<(u32, u64)> {
    let mut buffer = vec![0u8; chunk_size.max(1)];
    let mut crc = 0u32;
    let mut total = 0u64;

    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        crc = crc32(crc, &buffer[..read]);
        total += read as u64;
    }

    Ok((crc, total))
}
