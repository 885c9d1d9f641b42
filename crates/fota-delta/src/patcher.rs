//! Block-wise patch application
//!
//! A [`PatchSession`] validates a patch against an old image without touching
//! either file. [`PatchSession::apply`] then writes the new image metadata and
//! walks the block records, dispatching each one on its token:
//!
//! - `SKIP` copies the old block to its new offset
//! - `MODIFY` runs the three-stream delta against the old block
//! - `ADD` takes the block verbatim from the extra stream
//! - `REMOVE` stops, the destination is truncated at the current offset
//!
//! Every committed block is checked against its declared size and CRC first.
//!
//! # Example
//!
//! ```no_run
//! use fota_delta::{PatchConfig, PatchSession};
//! use std::path::Path;
//!
//! # fn example() -> Result<(), fota_delta::PatchError> {
//! let config = PatchConfig::default().to_new_file("firmware.new");
//! let session = PatchSession::open(Path::new("firmware.bin"), Path::new("update.patch"), config)?;
//! let report = session.apply()?;
//! println!("New image is {} bytes", report.final_size);
//! # Ok(())
//! # }
//! ```

use crate::backup::BlockBackupStore;
use crate::bspatch;
use crate::checksum::crc32;
use crate::codec::{CompressionCodec, codec_for};
use crate::config::{ImageFraming, PatchConfig, PatchMode};
use crate::error::{PatchError, PatchResult};
use crate::format::{BlockDiffHeader, CompressionFormat, PatchHeader, Token};
use crate::image::{BlockLayout, ImageMetadata, OldImage, verify_compatible};
use crate::reader::{PatchFileReader, SectionKind};
use crate::target::{InPlaceTarget, NewFileTarget, WriteTarget};
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Outcome of a successful patch run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchReport {
    /// Blocks copied unchanged
    pub blocks_skipped: u32,
    /// Blocks rebuilt from deltas
    pub blocks_modified: u32,
    /// Blocks taken from the extra stream
    pub blocks_added: u32,
    /// Old blocks dropped by truncation
    pub blocks_removed: u32,
    /// Old blocks captured before an overlapping write
    pub backups_taken: u32,
    /// Largest amount of backup memory held at once
    pub peak_backup_bytes: u64,
    /// Length of the new image
    pub final_size: u64,
}

/// A validated patch, ready to be applied
pub struct PatchSession {
    config: PatchConfig,
    old_path: PathBuf,
    patch: PatchFileReader<BufReader<File>>,
    patch_crc: u32,
    header: PatchHeader,
    format: CompressionFormat,
    codec: Option<Box<dyn CompressionCodec>>,
    old_file: File,
    old: OldImage,
    new_metadata: ImageMetadata,
}

impl std::fmt::Debug for PatchSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatchSession")
            .field("old_path", &self.old_path)
            .field("mode", &self.config.mode)
            .field("header", &self.header)
            .finish_non_exhaustive()
    }
}

impl PatchSession {
    /// Verify and parse a patch against an old image.
    ///
    /// Nothing is written. Fails if the patch CRC does not match, if any
    /// header is malformed, or if the old image does not fit the patch.
    pub fn open(old_path: &Path, patch_path: &Path, config: PatchConfig) -> PatchResult<Self> {
        config.validate()?;
        if let PatchMode::ToNewFile(new_path) = &config.mode
            && is_same_file(old_path, new_path)
        {
            return Err(PatchError::Config(format!(
                "output {} is the old image, omit it to patch in place",
                new_path.display()
            )));
        }

        let mut patch = PatchFileReader::open(patch_path)?;
        let patch_crc = patch.verify_crc(config.crc_chunk_size)?;

        let header = patch.parse_header()?;
        let format = header.compression_format()?;
        let new_metadata = patch.read_new_metadata(&header, config.framing)?;

        let mut old_file = File::open(old_path)?;
        let old = OldImage::parse(&mut old_file, &header, config.framing)?;

        if config.framing == ImageFraming::Raw && format.is_compressed() {
            return Err(PatchError::patching_condition(
                "raw images cannot be compressed",
            ));
        }
        if config.framing == ImageFraming::Framed {
            verify_compatible(&old.metadata, &new_metadata, &header)?;
        }

        if old.block_count() != header.blocks_oldfile {
            return Err(PatchError::patching_condition(format!(
                "old image has {} blocks, patch expects {}",
                old.block_count(),
                header.blocks_oldfile
            )));
        }
        if let Some(compression) = &new_metadata.compression
            && compression.sections != header.blocks_newfile
        {
            return Err(PatchError::patching_condition(format!(
                "new compression header lists {} blocks, patch declares {}",
                compression.sections, header.blocks_newfile
            )));
        }

        Ok(Self {
            codec: codec_for(format),
            config,
            old_path: old_path.to_path_buf(),
            patch,
            patch_crc,
            header,
            format,
            old_file,
            old,
            new_metadata,
        })
    }

    /// Parsed patch header
    pub fn header(&self) -> &PatchHeader {
        &self.header
    }

    /// CRC stored at the start of the patch file
    pub fn patch_crc(&self) -> u32 {
        self.patch_crc
    }

    /// Parsed old image
    pub fn old_image(&self) -> &OldImage {
        &self.old
    }

    /// Metadata the new image will carry
    pub fn new_metadata(&self) -> &ImageMetadata {
        &self.new_metadata
    }

    /// Compression format of both images
    pub fn compression_format(&self) -> CompressionFormat {
        self.format
    }

    /// Write the new image
    pub fn apply(self) -> PatchResult<PatchReport> {
        let target: Box<dyn WriteTarget> = match &self.config.mode {
            PatchMode::InPlace => Box::new(InPlaceTarget::open(
                &self.old_path,
                self.old.layout.clone(),
            )?),
            PatchMode::ToNewFile(path) => Box::new(NewFileTarget::create(path)?),
        };

        info!(
            "Applying patch to {} ({} -> {} blocks, compression {}, {})",
            self.old_path.display(),
            self.header.blocks_oldfile,
            self.header.blocks_newfile,
            self.format,
            if target.is_in_place() {
                "in place"
            } else {
                "to new file"
            }
        );

        BlockPatcher::new(self, target).run()
    }
}

/// Apply `patch_path` to `old_path` in one call
pub fn apply_patch(old_path: &Path, patch_path: &Path, config: PatchConfig) -> PatchResult<PatchReport> {
    PatchSession::open(old_path, patch_path, config)?.apply()
}

fn is_same_file(a: &Path, b: &Path) -> bool {
    match (std::fs::canonicalize(a), std::fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Mutable state of one patch run
struct BlockPatcher {
    session: PatchSession,
    target: Box<dyn WriteTarget>,
    backups: BlockBackupStore,
    new_layout: Option<BlockLayout>,
    write_pos: u64,
    report: PatchReport,
}

impl BlockPatcher {
    fn new(session: PatchSession, target: Box<dyn WriteTarget>) -> Self {
        let backups = BlockBackupStore::new(session.header.common_blocks())
            .with_warn_threshold(session.old.file_len);
        let new_layout = session
            .new_metadata
            .compression
            .as_ref()
            .map(|compression| BlockLayout::Compressed {
                first_offset: session.new_metadata.encoded_len(),
                header: compression.clone(),
            });

        Self {
            session,
            target,
            backups,
            new_layout,
            write_pos: 0,
            report: PatchReport::default(),
        }
    }

    fn run(mut self) -> PatchResult<PatchReport> {
        self.commit_metadata()?;

        let total = self.session.header.block_records();
        while let Some(block) = self.session.patch.next_block_diff_header()? {
            let index = block.block_number;
            debug!(
                "Block {}/{}: {} (size_u={}, size_c={}, crc={:#010x})",
                index,
                total,
                block.token,
                block.new_block_size_u,
                block.new_block_size_c,
                block.new_block_crc
            );
            self.check_record(&block)?;

            match block.token {
                Token::Skip => self.skip_block(&block)?,
                Token::Modify => self.modify_block(&block)?,
                Token::Add => self.add_block(&block)?,
                Token::Remove => {
                    self.report.blocks_removed = total.saturating_sub(index);
                    debug!(
                        "Removing {} trailing blocks, truncating at {}",
                        self.report.blocks_removed, self.write_pos
                    );
                    break;
                }
            }
        }

        self.target.truncate(self.write_pos)?;
        self.target.finish()?;

        self.report.backups_taken = self.backups.backups_taken();
        self.report.peak_backup_bytes = self.backups.peak_bytes();
        self.report.final_size = self.write_pos;

        info!(
            "Patch applied: {} skipped, {} modified, {} added, {} removed, {} backups (peak {} bytes), new image {} bytes",
            self.report.blocks_skipped,
            self.report.blocks_modified,
            self.report.blocks_added,
            self.report.blocks_removed,
            self.report.backups_taken,
            self.report.peak_backup_bytes,
            self.report.final_size
        );

        Ok(self.report)
    }

    /// Reject records whose token or size cannot occur at their index.
    ///
    /// Blocks both images share may only be kept or rebuilt. Past the old
    /// image a block can only be added, and REMOVE is only valid once every
    /// new block has been written.
    fn check_record(&self, block: &BlockDiffHeader) -> PatchResult<()> {
        let header = &self.session.header;
        let index = block.block_number;
        let placed = match block.token {
            Token::Skip | Token::Modify => index < header.common_blocks(),
            Token::Add => index < header.blocks_newfile,
            Token::Remove => index >= header.blocks_newfile,
        };
        if !placed {
            return Err(PatchError::corrupt_patch(format!(
                "{} record at block {index} does not fit a {} -> {} block patch",
                block.token, header.blocks_oldfile, header.blocks_newfile
            )));
        }

        if block.token != Token::Remove && block.new_block_size_u > header.blocksize_newfile {
            return Err(PatchError::corrupt_patch(format!(
                "block {index} declares {} bytes, blocksize is {}",
                block.new_block_size_u, header.blocksize_newfile
            )));
        }

        Ok(())
    }

    fn compressed(&self) -> bool {
        self.session.format.is_compressed()
    }

    /// Write the new CRC, binary header and compression header at offset 0
    fn commit_metadata(&mut self) -> PatchResult<()> {
        let metadata = self.session.new_metadata.to_bytes()?;
        if !metadata.is_empty() {
            self.target.write_block(0, &metadata, &mut self.backups)?;
        }
        self.write_pos = metadata.len() as u64;
        Ok(())
    }

    /// Stored bytes of old block `index`, from its backup if one was taken
    fn read_old_block(&mut self, index: u32) -> PatchResult<Vec<u8>> {
        let range = self.session.old.layout.block_range(index).ok_or_else(|| {
            PatchError::corrupt_patch(format!("block {index} has no counterpart in the old image"))
        })?;

        if index < self.backups.len() {
            self.backups
                .ensure_backup(index, &mut self.session.old_file, range)?;
            return Ok(self.backups.get_backup(index)?.to_vec());
        }

        let mut buffer = vec![0u8; (range.end - range.start) as usize];
        self.session.old_file.seek(SeekFrom::Start(range.start))?;
        self.session.old_file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    fn verify_block(&self, block: &BlockDiffHeader, bytes: &[u8]) -> PatchResult<()> {
        let expected = block.stored_size(self.compressed());
        if bytes.len() as u64 != u64::from(expected) {
            return Err(PatchError::block_integrity(
                block.block_number,
                format!("size {} does not match declared {expected}", bytes.len()),
            ));
        }

        let crc = crc32(0, bytes);
        if crc != block.new_block_crc {
            return Err(PatchError::block_integrity(
                block.block_number,
                format!(
                    "crc {crc:#010x} does not match declared {:#010x}",
                    block.new_block_crc
                ),
            ));
        }

        Ok(())
    }

    /// Write a verified block at its new offset and retire its backup
    fn commit(&mut self, index: u32, bytes: &[u8]) -> PatchResult<()> {
        let offset = match &self.new_layout {
            Some(layout) => {
                let range = layout.block_range(index).ok_or_else(|| {
                    PatchError::corrupt_patch(format!(
                        "block {index} is missing from the new compression header"
                    ))
                })?;
                if range.end - range.start != bytes.len() as u64 {
                    return Err(PatchError::corrupt_patch(format!(
                        "block {index} is {} bytes, new compression header reserves {}",
                        bytes.len(),
                        range.end - range.start
                    )));
                }
                range.start
            }
            None => self.write_pos,
        };

        self.target.write_block(offset, bytes, &mut self.backups)?;
        self.write_pos = offset + bytes.len() as u64;
        self.backups.mark_patched(index);
        Ok(())
    }

    fn encode(&self, plain: Vec<u8>) -> PatchResult<Vec<u8>> {
        match &self.session.codec {
            Some(codec) => codec.encode(&plain, self.session.header.blocksize_newfile),
            None => Ok(plain),
        }
    }

    fn skip_block(&mut self, block: &BlockDiffHeader) -> PatchResult<()> {
        let bytes = self.read_old_block(block.block_number)?;
        self.verify_block(block, &bytes)?;
        self.commit(block.block_number, &bytes)?;
        self.report.blocks_skipped += 1;
        Ok(())
    }

    fn modify_block(&mut self, block: &BlockDiffHeader) -> PatchResult<()> {
        let stored = self.read_old_block(block.block_number)?;
        let old = match &self.session.codec {
            Some(codec) => codec.decode(&stored, self.session.header.blocksize_oldfile)?,
            None => stored,
        };

        let patch = &mut self.session.patch;
        let mut ctrl = patch.open_subsection(SectionKind::Control, block.size_ctrl_block)?;
        let mut diff = patch.open_subsection(SectionKind::Diff, block.size_diff_block)?;
        let mut extra = patch.open_subsection(SectionKind::Extra, block.size_extra_block)?;

        let new = bspatch::apply(
            &old,
            block.new_block_size_u as usize,
            &mut ctrl,
            &mut diff,
            &mut extra,
        )?;

        let bytes = self.encode(new)?;
        self.verify_block(block, &bytes)?;
        self.commit(block.block_number, &bytes)?;
        self.report.blocks_modified += 1;
        Ok(())
    }

    fn add_block(&mut self, block: &BlockDiffHeader) -> PatchResult<()> {
        let mut extra = self
            .session
            .patch
            .open_subsection(SectionKind::Extra, block.size_extra_block)?;
        let mut plain = vec![0u8; block.new_block_size_u as usize];
        extra
            .read_exact(&mut plain)
            .map_err(|e| PatchError::from_stream_read("extra stream", &e))?;

        let bytes = self.encode(plain)?;
        self.verify_block(block, &bytes)?;
        self.commit(block.block_number, &bytes)?;
        self.report.blocks_added += 1;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_same_output_path_is_rejected() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let old = dir.path().join("old.bin");
        let patch = dir.path().join("update.patch");
        std::fs::write(&old, [0u8; 16]).unwrap();
        std::fs::write(&patch, [0u8; 16]).unwrap();

        let config = PatchConfig::default().to_new_file(&old);
        let result = PatchSession::open(&old, &patch, config);
        assert!(matches!(result, Err(PatchError::Config(_))));
    }

    #[test]
    fn test_missing_patch_is_io_error() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let old = dir.path().join("old.bin");
        std::fs::write(&old, [0u8; 16]).unwrap();

        let result = apply_patch(&old, &dir.path().join("missing.patch"), PatchConfig::default());
        assert!(matches!(result, Err(PatchError::Io(_))));
    }

    #[test]
    fn test_invalid_config_fails_before_io() {
        let result = PatchSession::open(
            Path::new("/nonexistent/old"),
            Path::new("/nonexistent/patch"),
            PatchConfig::default().with_crc_chunk_size(0),
        );
        assert!(matches!(result, Err(PatchError::Config(_))));
    }
}
