//! Image metadata and block layout
//!
//! Framed images start with a CRC and a binary header whose widths are given
//! by the patch header. Compressed images follow them with a
//! [`CompressionHeader`]. The block payload comes after the metadata.

use crate::config::ImageFraming;
use crate::error::{PatchError, PatchResult};
use crate::format::{CompressionFormat, CompressionHeader, PatchHeader};
use binrw::{BinRead, BinWrite};
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::ops::Range;
use tracing::debug;

/// Metadata prefix of an image
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ImageMetadata {
    /// Image CRC field, kept as raw bytes
    pub crc: Vec<u8>,
    /// Opaque binary header
    pub binary_header: Vec<u8>,
    /// Compression header, present for compressed images
    pub compression: Option<CompressionHeader>,
}

impl ImageMetadata {
    /// Read the new image metadata that follows the patch header.
    ///
    /// The compression header width is the patch header's `comp_header_size`.
    pub fn read_new<R: Read>(
        reader: &mut R,
        header: &PatchHeader,
        framing: ImageFraming,
    ) -> PatchResult<Self> {
        if framing == ImageFraming::Raw {
            return Ok(Self::default());
        }

        let crc = read_field(reader, header.crc_newfile_size, "new image CRC")?;
        let binary_header = read_field(reader, header.binary_header_size, "new binary header")?;

        let compression = if header.compression_format()?.is_compressed() {
            let raw = read_field(reader, header.comp_header_size, "new compression header")?;
            let parsed = parse_compression_header(&raw)?;
            Some(parsed)
        } else {
            None
        };

        Ok(Self {
            crc,
            binary_header,
            compression,
        })
    }

    /// Encoded width of the metadata, i.e. the offset of the first block
    pub fn encoded_len(&self) -> u64 {
        let compression = self
            .compression
            .as_ref()
            .map_or(0, |h| u64::from(h.size_header));
        self.crc.len() as u64 + self.binary_header.len() as u64 + compression
    }

    /// Serialize the metadata as it appears at the start of the image
    pub fn to_bytes(&self) -> PatchResult<Vec<u8>> {
        let mut out = Vec::with_capacity(self.encoded_len() as usize);
        out.extend_from_slice(&self.crc);
        out.extend_from_slice(&self.binary_header);
        if let Some(compression) = &self.compression {
            let mut cursor = Cursor::new(Vec::new());
            compression.write(&mut cursor)?;
            out.extend_from_slice(&cursor.into_inner());
        }
        Ok(out)
    }
}

fn read_field<R: Read>(reader: &mut R, width: u32, what: &str) -> PatchResult<Vec<u8>> {
    let mut buf = vec![0u8; width as usize];
    reader.read_exact(&mut buf).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            PatchError::format(format!("{what} truncated"))
        } else {
            PatchError::Io(e)
        }
    })?;
    Ok(buf)
}

fn parse_compression_header(raw: &[u8]) -> PatchResult<CompressionHeader> {
    let header = CompressionHeader::read(&mut Cursor::new(raw))?;
    header.validate()?;
    if usize::from(header.size_header) != raw.len() {
        return Err(PatchError::format(format!(
            "compression header is {} bytes, field holds {}",
            header.size_header,
            raw.len()
        )));
    }
    Ok(header)
}

/// Location of each block within an image file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockLayout {
    /// Fixed-size blocks, the last one may be short
    Uncompressed {
        /// File offset of block 0
        first_offset: u64,
        /// Uncompressed bytes per block
        blocksize: u64,
        /// Total payload length
        payload_len: u64,
    },
    /// Variable-size blocks described by a compression header
    Compressed {
        /// File offset of block 0
        first_offset: u64,
        /// Header holding the section offset table
        header: CompressionHeader,
    },
}

impl BlockLayout {
    /// Number of blocks in the image
    pub fn block_count(&self) -> u32 {
        match self {
            Self::Uncompressed {
                blocksize,
                payload_len,
                ..
            } => payload_len.div_ceil(*blocksize) as u32,
            Self::Compressed { header, .. } => header.secoff.len().saturating_sub(1) as u32,
        }
    }

    /// Absolute file range of block `index`
    pub fn block_range(&self, index: u32) -> Option<Range<u64>> {
        match self {
            Self::Uncompressed {
                first_offset,
                blocksize,
                payload_len,
            } => {
                let start = u64::from(index) * blocksize;
                if start >= *payload_len {
                    return None;
                }
                let end = (start + blocksize).min(*payload_len);
                Some(first_offset + start..first_offset + end)
            }
            Self::Compressed {
                first_offset,
                header,
            } => {
                let section = header.section_range(index)?;
                Some(first_offset + section.start..first_offset + section.end)
            }
        }
    }

    /// Indices of blocks below `limit` whose bytes intersect `range`
    pub fn blocks_overlapping(&self, range: &Range<u64>, limit: u32) -> Vec<u32> {
        if range.start >= range.end {
            return Vec::new();
        }

        let count = self.block_count().min(limit);
        match self {
            Self::Uncompressed {
                first_offset,
                blocksize,
                ..
            } => {
                let rel_start = range.start.saturating_sub(*first_offset);
                let rel_end = range.end.saturating_sub(*first_offset);
                if rel_end == 0 {
                    return Vec::new();
                }
                let first = (rel_start / blocksize).min(u64::from(count)) as u32;
                let last = ((rel_end - 1) / blocksize + 1).min(u64::from(count)) as u32;
                (first..last).collect()
            }
            Self::Compressed { .. } => (0..count)
                .filter(|&i| {
                    self.block_range(i)
                        .is_some_and(|block| block.start < range.end && range.start < block.end)
                })
                .collect(),
        }
    }

    /// End offset of the last block
    pub fn end_offset(&self) -> u64 {
        match self {
            Self::Uncompressed {
                first_offset,
                payload_len,
                ..
            } => first_offset + payload_len,
            Self::Compressed {
                first_offset,
                header,
            } => first_offset + header.payload_len(),
        }
    }
}

/// Parsed old image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OldImage {
    /// Metadata prefix
    pub metadata: ImageMetadata,
    /// Block locations
    pub layout: BlockLayout,
    /// File length at open time
    pub file_len: u64,
}

impl OldImage {
    /// Parse the old image metadata and derive its block layout.
    ///
    /// The CRC and binary header widths come from the patch header. The old
    /// compression header width is discovered from its leading `size_header`.
    pub fn parse<R: Read + Seek>(
        reader: &mut R,
        header: &PatchHeader,
        framing: ImageFraming,
    ) -> PatchResult<Self> {
        let file_len = reader.seek(SeekFrom::End(0))?;
        reader.seek(SeekFrom::Start(0))?;

        let format = header.compression_format()?;
        if header.blocksize_oldfile == 0 {
            return Err(PatchError::format("old blocksize is zero"));
        }

        let metadata = match framing {
            ImageFraming::Raw => ImageMetadata::default(),
            ImageFraming::Framed => {
                let crc = read_image_field(reader, header.crc_newfile_size, "old image CRC")?;
                let binary_header =
                    read_image_field(reader, header.binary_header_size, "old binary header")?;
                let compression = if format.is_compressed() {
                    Some(read_old_compression_header(reader)?)
                } else {
                    None
                };
                ImageMetadata {
                    crc,
                    binary_header,
                    compression,
                }
            }
        };

        let first_offset = metadata.encoded_len();
        if first_offset > file_len {
            return Err(PatchError::patching_condition(format!(
                "old image of {file_len} bytes is shorter than its {first_offset}-byte metadata"
            )));
        }

        let layout = match &metadata.compression {
            Some(compression) => BlockLayout::Compressed {
                first_offset,
                header: compression.clone(),
            },
            None => BlockLayout::Uncompressed {
                first_offset,
                blocksize: u64::from(header.blocksize_oldfile),
                payload_len: file_len - first_offset,
            },
        };

        if layout.end_offset() > file_len {
            return Err(PatchError::patching_condition(format!(
                "old image of {file_len} bytes is shorter than its block table ({} bytes)",
                layout.end_offset()
            )));
        }

        debug!(
            file_len,
            first_offset,
            blocks = layout.block_count(),
            format = %format,
            "Parsed old image"
        );

        Ok(Self {
            metadata,
            layout,
            file_len,
        })
    }

    /// Number of blocks in the old image
    pub fn block_count(&self) -> u32 {
        self.layout.block_count()
    }

}

fn read_image_field<R: Read>(reader: &mut R, width: u32, what: &str) -> PatchResult<Vec<u8>> {
    let mut buf = vec![0u8; width as usize];
    reader.read_exact(&mut buf).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            PatchError::patching_condition(format!("{what} truncated"))
        } else {
            PatchError::Io(e)
        }
    })?;
    Ok(buf)
}

fn read_old_compression_header<R: Read + Seek>(reader: &mut R) -> PatchResult<CompressionHeader> {
    let start = reader.stream_position()?;
    let mut size = [0u8; 2];
    reader.read_exact(&mut size)?;
    reader.seek(SeekFrom::Start(start))?;

    let width = u16::from_le_bytes(size);
    let raw = read_image_field(reader, u32::from(width), "old compression header")?;
    parse_compression_header(&raw)
}

/// Check that the old and new images can be patched against each other.
///
/// For compressed images the block size and compression format must match.
pub fn verify_compatible(
    old: &ImageMetadata,
    new: &ImageMetadata,
    header: &PatchHeader,
) -> PatchResult<()> {
    match (&old.compression, &new.compression) {
        (Some(old_comp), Some(new_comp)) => {
            if old_comp.blocksize != new_comp.blocksize {
                return Err(PatchError::patching_condition(format!(
                    "blocksize differs: old {} new {}",
                    old_comp.blocksize, new_comp.blocksize
                )));
            }
            if old_comp.compression_format != new_comp.compression_format {
                return Err(PatchError::patching_condition(format!(
                    "compression format differs: old {} new {}",
                    old_comp.compression_format, new_comp.compression_format
                )));
            }
            if old_comp.blocksize != header.blocksize_oldfile
                || new_comp.blocksize != header.blocksize_newfile
            {
                return Err(PatchError::patching_condition(format!(
                    "patch was built for blocksize {}/{}, images use {}",
                    header.blocksize_oldfile, header.blocksize_newfile, old_comp.blocksize
                )));
            }
            if old_comp.format()? != header.compression_format()? {
                return Err(PatchError::patching_condition(
                    "old image compression does not match the patch",
                ));
            }
            Ok(())
        }
        (None, None) => {
            if header.compression_format()? == CompressionFormat::None {
                Ok(())
            } else {
                Err(PatchError::patching_condition(
                    "patch expects compressed images",
                ))
            }
        }
        _ => Err(PatchError::patching_condition(
            "old and new images disagree on compression",
        )),
    }
}
