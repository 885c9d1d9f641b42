//! On-disk structures of patch files and images
//!
//! All integers are little-endian. A patch file is laid out as:
//! - CRC-32 of everything after it
//! - [`PatchHeader`]
//! - new image CRC and binary header (framed images only)
//! - new image [`CompressionHeader`] (compressed images only)
//! - one [`BlockDiffHeader`] per block, each followed by its gzip-wrapped
//!   control, diff and extra sections

mod block;
mod compression;
mod header;

pub use block::{BLOCK_DIFF_HEADER_SIZE, BlockDiffHeader, Token};
pub use compression::{COMPRESSION_HEADER_FIXED_SIZE, CompressionHeader};
pub use header::{
    CompressionFormat, PATCH_CRC_SIZE, PATCH_HEADER_SIZE, PATCH_SIGNATURE, PatchHeader,
};
