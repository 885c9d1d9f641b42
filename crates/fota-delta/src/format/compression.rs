//! Compression header of a compressed image
//!
//! A compressed image stores its blocks back to back after this header. The
//! `secoff` table holds cumulative offsets of each compressed block relative
//! to the first one, with one trailing entry marking the end of the last block.

use crate::error::{PatchError, PatchResult};
use crate::format::CompressionFormat;
use binrw::{BinRead, BinWrite};
use std::ops::Range;

/// Width of the fixed part of [`CompressionHeader`], before the offset table
pub const COMPRESSION_HEADER_FIXED_SIZE: usize = 16;

/// Compression header (little-endian)
#[derive(Debug, Clone, PartialEq, Eq, BinRead, BinWrite)]
#[br(little)]
#[bw(little)]
pub struct CompressionHeader {
    /// Total encoded width of this header
    pub size_header: u16,
    /// Compression format of the blocks
    pub compression_format: u16,
    /// Uncompressed bytes per block
    pub blocksize: u32,
    /// Number of compressed blocks
    pub sections: u32,
    /// Total uncompressed payload size
    pub binary_size: u32,
    /// Cumulative block offsets, `sections + 1` entries
    #[br(count = sections as usize + 1)]
    pub secoff: Vec<u32>,
}

impl CompressionHeader {
    /// Build a header from per-block compressed sizes
    pub fn from_block_sizes(
        format: CompressionFormat,
        blocksize: u32,
        binary_size: u32,
        block_sizes: &[u32],
    ) -> Self {
        let mut secoff = Vec::with_capacity(block_sizes.len() + 1);
        let mut offset = 0u32;
        secoff.push(offset);
        for size in block_sizes {
            offset += size;
            secoff.push(offset);
        }

        let sections = block_sizes.len() as u32;
        Self {
            size_header: Self::encoded_size(sections) as u16,
            compression_format: format.as_raw() as u16,
            blocksize,
            sections,
            binary_size,
            secoff,
        }
    }

    /// Encoded width of a header with `sections` blocks
    pub fn encoded_size(sections: u32) -> usize {
        COMPRESSION_HEADER_FIXED_SIZE + 4 * (sections as usize + 1)
    }

    /// Parsed compression format
    pub fn format(&self) -> PatchResult<CompressionFormat> {
        CompressionFormat::try_from(u32::from(self.compression_format))
    }

    /// Check the internal consistency of the header
    pub fn validate(&self) -> PatchResult<()> {
        self.format()?;

        let expected = Self::encoded_size(self.sections);
        if usize::from(self.size_header) != expected {
            return Err(PatchError::format(format!(
                "compression header declares {} bytes, {} sections need {expected}",
                self.size_header, self.sections
            )));
        }

        if self.blocksize == 0 {
            return Err(PatchError::format("compression header blocksize is zero"));
        }

        match self.secoff.first() {
            Some(0) => {}
            Some(first) => {
                return Err(PatchError::format(format!(
                    "first section offset must be 0, got {first}"
                )));
            }
            None => return Err(PatchError::format("empty section offset table")),
        }

        if let Some(index) = self.secoff.windows(2).position(|pair| pair[1] < pair[0]) {
            return Err(PatchError::format(format!(
                "section offsets decrease at block {index}"
            )));
        }

        Ok(())
    }

    /// Byte range of compressed block `index`, relative to the first block
    pub fn section_range(&self, index: u32) -> Option<Range<u64>> {
        let start = *self.secoff.get(index as usize)?;
        let end = *self.secoff.get(index as usize + 1)?;
        Some(u64::from(start)..u64::from(end))
    }

    /// Total compressed payload size
    pub fn payload_len(&self) -> u64 {
        self.secoff.last().map_or(0, |&end| u64::from(end))
    }
}
