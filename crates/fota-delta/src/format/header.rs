//! Patch file header
//!
//! The header is a fixed 40-byte little-endian structure that follows the
//! leading whole-file CRC:
//! - 8-byte signature "BLCKDIFF"
//! - compression format of the old (and new) image
//! - block counts and block sizes of both images
//! - byte widths of the new-image metadata fields that follow the header

use crate::error::{PatchError, PatchResult};
use binrw::{BinRead, BinWrite};

/// Patch file signature
pub const PATCH_SIGNATURE: [u8; 8] = *b"BLCKDIFF";

/// Encoded size of [`PatchHeader`] in bytes
pub const PATCH_HEADER_SIZE: u64 = 40;

/// Width of the whole-file CRC that precedes the header
pub const PATCH_CRC_SIZE: u64 = 4;

/// Image compression format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompressionFormat {
    /// Blocks are stored raw
    None,
    /// Blocks are stored as independent LZMA streams
    Lzma,
}

impl CompressionFormat {
    /// Highest valid raw value
    pub const MAX: u32 = 1;

    /// Raw on-disk value
    pub const fn as_raw(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Lzma => 1,
        }
    }

    /// Whether blocks of this format go through a codec
    pub const fn is_compressed(self) -> bool {
        !matches!(self, Self::None)
    }
}

impl TryFrom<u32> for CompressionFormat {
    type Error = PatchError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Lzma),
            other => Err(PatchError::format(format!(
                "compression format {other} is not in valid range 0..={}",
                Self::MAX
            ))),
        }
    }
}

impl std::fmt::Display for CompressionFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Lzma => write!(f, "lzma"),
        }
    }
}

/// Patch header (40 bytes, little-endian)
#[derive(Debug, Clone, PartialEq, Eq, BinRead, BinWrite)]
#[br(little)]
#[bw(little)]
pub struct PatchHeader {
    /// File signature, must be [`PATCH_SIGNATURE`]
    #[br(assert(signature == PATCH_SIGNATURE, "patch signature mismatch: got {:02x?}", signature))]
    pub signature: [u8; 8],

    /// Compression format of the old image
    #[br(assert(old_file_compression_format <= CompressionFormat::MAX, "old_file_compression_format value ({}) is not in valid range", old_file_compression_format))]
    pub old_file_compression_format: u32,

    /// Number of blocks in the old image
    pub blocks_oldfile: u32,

    /// Number of blocks in the new image
    pub blocks_newfile: u32,

    /// Uncompressed block size of the old image
    pub blocksize_oldfile: u32,

    /// Uncompressed block size of the new image
    pub blocksize_newfile: u32,

    /// Width of the image CRC field
    pub crc_newfile_size: u32,

    /// Width of the image binary header
    pub binary_header_size: u32,

    /// Width of the new image compression header (0 when uncompressed)
    pub comp_header_size: u32,
}

impl PatchHeader {
    /// Parsed compression format of the old image
    pub fn compression_format(&self) -> PatchResult<CompressionFormat> {
        CompressionFormat::try_from(self.old_file_compression_format)
    }

    /// Total number of block records in the patch
    pub fn block_records(&self) -> u32 {
        self.blocks_oldfile.max(self.blocks_newfile)
    }

    /// Number of block indices present in both images
    pub fn common_blocks(&self) -> u32 {
        self.blocks_oldfile.min(self.blocks_newfile)
    }

    /// Validate header fields beyond what the binary layout enforces
    pub fn validate(&self) -> PatchResult<()> {
        if self.signature != PATCH_SIGNATURE {
            return Err(PatchError::format("patch signature mismatch"));
        }

        let format = self.compression_format()?;

        if self.blocks_oldfile == 0 && self.blocks_newfile == 0 {
            return Err(PatchError::format("patch declares no blocks"));
        }

        if self.blocksize_oldfile == 0 || self.blocksize_newfile == 0 {
            return Err(PatchError::format("block size must be non-zero"));
        }

        if format.is_compressed() && self.comp_header_size == 0 {
            return Err(PatchError::format(
                "compressed patch without compression header",
            ));
        }

        Ok(())
    }
}
