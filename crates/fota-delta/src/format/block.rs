//! Per-block diff record header

use binrw::{BinRead, BinWrite};

/// Encoded size of [`BlockDiffHeader`] in bytes
pub const BLOCK_DIFF_HEADER_SIZE: u64 = 32;

/// Instruction describing how a new block is derived
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, BinRead, BinWrite)]
#[brw(little, repr = u32)]
pub enum Token {
    /// Block is unchanged, copy the old bytes to their new offset
    Skip = 0,
    /// Block is rebuilt from the old block plus ctrl/diff/extra streams
    Modify = 1,
    /// Block only exists in the new image, bytes come from the extra stream
    Add = 2,
    /// Old image is longer, truncate and stop
    Remove = 3,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Skip => "SKIP",
            Self::Modify => "MODIFY",
            Self::Add => "ADD",
            Self::Remove => "REMOVE",
        };
        f.write_str(name)
    }
}

/// Header preceding each block record in the patch stream
#[derive(Debug, Clone, PartialEq, Eq, BinRead, BinWrite)]
#[br(little)]
#[bw(little)]
pub struct BlockDiffHeader {
    /// Index of the block this record describes
    pub block_number: u32,
    /// How to derive the new block
    pub token: Token,
    /// Uncompressed size of the new block
    pub new_block_size_u: u32,
    /// Compressed size of the new block (0 for uncompressed images)
    pub new_block_size_c: u32,
    /// CRC-32 of the committed block bytes
    pub new_block_crc: u32,
    /// Length of the gzip-wrapped control section
    pub size_ctrl_block: u32,
    /// Length of the gzip-wrapped diff section
    pub size_diff_block: u32,
    /// Length of the gzip-wrapped extra section
    pub size_extra_block: u32,
}

impl BlockDiffHeader {
    /// Size of the block as it is stored on the device
    pub fn stored_size(&self, compressed: bool) -> u32 {
        if compressed {
            self.new_block_size_c
        } else {
            self.new_block_size_u
        }
    }

    /// Total bytes of sub-sections that follow this header
    pub fn payload_len(&self) -> u64 {
        match self.token {
            Token::Modify => {
                u64::from(self.size_ctrl_block)
                    + u64::from(self.size_diff_block)
                    + u64::from(self.size_extra_block)
            }
            Token::Add => u64::from(self.size_extra_block),
            Token::Skip | Token::Remove => 0,
        }
    }
}
