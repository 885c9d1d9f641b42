//! Sequential patch file reader
//!
//! The reader verifies the whole-file CRC, parses the header and then walks
//! the block records in order. Each MODIFY record is followed by three gzip
//! members laid out back to back (control, diff, extra); an ADD record by
//! the extra member only.

use crate::checksum::crc32_stream;
use crate::config::ImageFraming;
use crate::error::{PatchError, PatchResult};
use crate::format::{BlockDiffHeader, PATCH_CRC_SIZE, PatchHeader};
use crate::image::ImageMetadata;
use binrw::BinRead;
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{BufReader, Cursor, Read, Seek, SeekFrom};
use std::path::Path;
use tracing::{debug, trace};

/// Delta section of a block record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    /// Control triples
    Control,
    /// Bytes added to old data
    Diff,
    /// Bytes copied verbatim
    Extra,
}

impl std::fmt::Display for SectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Control => write!(f, "control"),
            Self::Diff => write!(f, "diff"),
            Self::Extra => write!(f, "extra"),
        }
    }
}

/// Decompressing reader over one delta section
pub type SectionReader = GzDecoder<Cursor<Vec<u8>>>;

/// Reader over a patch file
#[derive(Debug)]
pub struct PatchFileReader<R> {
    inner: R,
    position: u64,
    file_len: Option<u64>,
    total_blocks: u32,
    blocks_read: u32,
}

impl PatchFileReader<BufReader<File>> {
    /// Open a patch file from disk
    pub fn open(path: &Path) -> PatchResult<Self> {
        let file = File::open(path)?;
        Ok(Self::new(BufReader::new(file)))
    }
}

impl<R: Read + Seek> PatchFileReader<R> {
    /// Wrap an already open patch stream
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            position: 0,
            file_len: None,
            total_blocks: 0,
            blocks_read: 0,
        }
    }

    /// Verify the leading CRC against the rest of the file.
    ///
    /// Returns the verified CRC. Must run before any header is trusted.
    pub fn verify_crc(&mut self, chunk_size: usize) -> PatchResult<u32> {
        self.inner.seek(SeekFrom::Start(0))?;

        let mut stored = [0u8; PATCH_CRC_SIZE as usize];
        self.inner.read_exact(&mut stored).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                PatchError::corrupt_patch("patch file too short to hold its CRC")
            } else {
                PatchError::Io(e)
            }
        })?;
        let stored = u32::from_le_bytes(stored);

        let (computed, len) = crc32_stream(&mut self.inner, chunk_size)?;
        if computed != stored {
            return Err(PatchError::corrupt_patch(format!(
                "patch CRC mismatch: stored {stored:#010x}, computed {computed:#010x}"
            )));
        }

        debug!(crc = stored, len, "Patch CRC verified");
        self.file_len = Some(PATCH_CRC_SIZE + len);
        self.seek_to(PATCH_CRC_SIZE)?;
        Ok(stored)
    }

    /// Parse the patch header that follows the CRC
    pub fn parse_header(&mut self) -> PatchResult<PatchHeader> {
        self.seek_to(PATCH_CRC_SIZE)?;
        let header = PatchHeader::read(&mut self.inner)?;
        header.validate()?;

        self.position = self.inner.stream_position()?;
        self.total_blocks = header.block_records();
        self.blocks_read = 0;
        Ok(header)
    }

    /// Read the new image metadata that follows the header
    pub fn read_new_metadata(
        &mut self,
        header: &PatchHeader,
        framing: ImageFraming,
    ) -> PatchResult<ImageMetadata> {
        let metadata = ImageMetadata::read_new(&mut self.inner, header, framing)?;
        self.position += metadata.encoded_len();
        Ok(metadata)
    }

    /// Read the next block record header.
    ///
    /// Returns `None` once every record declared by the header has been read.
    pub fn next_block_diff_header(&mut self) -> PatchResult<Option<BlockDiffHeader>> {
        if self.blocks_read >= self.total_blocks {
            return Ok(None);
        }

        let header = BlockDiffHeader::read(&mut self.inner).map_err(|e| {
            let truncated = matches!(
                e.root_cause(),
                binrw::Error::Io(io) if io.kind() == std::io::ErrorKind::UnexpectedEof
            );
            if truncated {
                PatchError::corrupt_patch(format!(
                    "patch ends before block record {}",
                    self.blocks_read
                ))
            } else {
                PatchError::from(e)
            }
        })?;

        if header.block_number != self.blocks_read {
            return Err(PatchError::corrupt_patch(format!(
                "block record {} carries block number {}",
                self.blocks_read, header.block_number
            )));
        }

        self.position += crate::format::BLOCK_DIFF_HEADER_SIZE;

        let payload = header.payload_len();
        let remaining = self.remaining()?;
        if payload > remaining {
            return Err(PatchError::corrupt_patch(format!(
                "block record {} declares {payload} section bytes, {remaining} remain",
                header.block_number
            )));
        }

        self.blocks_read += 1;
        Ok(Some(header))
    }

    /// Open the next `len` bytes as a gzip-wrapped delta section.
    ///
    /// The underlying position advances past the section immediately, so the
    /// next section can be opened before this one is consumed.
    pub fn open_subsection(&mut self, kind: SectionKind, len: u32) -> PatchResult<SectionReader> {
        let remaining = self.remaining()?;
        if u64::from(len) > remaining {
            return Err(PatchError::corrupt_patch(format!(
                "{kind} section of {len} bytes at offset {} overruns the patch ({remaining} bytes left)",
                self.position
            )));
        }

        let mut raw = vec![0u8; len as usize];
        self.inner.read_exact(&mut raw).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                PatchError::corrupt_patch(format!(
                    "{kind} section of {len} bytes at offset {} is truncated",
                    self.position
                ))
            } else {
                PatchError::Io(e)
            }
        })?;

        trace!(section = %kind, offset = self.position, len, "Opened delta section");
        self.position += u64::from(len);
        Ok(GzDecoder::new(Cursor::new(raw)))
    }

    /// Number of block records read so far
    pub fn blocks_read(&self) -> u32 {
        self.blocks_read
    }

    /// Bytes left in the patch after the current position
    fn remaining(&mut self) -> PatchResult<u64> {
        let file_len = match self.file_len {
            Some(len) => len,
            None => {
                let here = self.inner.stream_position()?;
                let len = self.inner.seek(SeekFrom::End(0))?;
                self.inner.seek(SeekFrom::Start(here))?;
                self.file_len = Some(len);
                len
            }
        };
        Ok(file_len.saturating_sub(self.position))
    }

    fn seek_to(&mut self, offset: u64) -> PatchResult<()> {
        self.inner.seek(SeekFrom::Start(offset))?;
        self.position = offset;
        Ok(())
    }
}
