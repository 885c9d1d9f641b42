//! Destinations for reconstructed blocks

use crate::backup::BlockBackupStore;
use crate::error::PatchResult;
use crate::image::BlockLayout;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use tracing::trace;

/// Write side of a patch session
pub trait WriteTarget {
    /// Write `bytes` at `offset`, capturing any old block the write would clobber
    fn write_block(
        &mut self,
        offset: u64,
        bytes: &[u8],
        backups: &mut BlockBackupStore,
    ) -> PatchResult<()>;

    /// Cut the destination to `len` bytes
    fn truncate(&mut self, len: u64) -> PatchResult<()>;

    /// Flush and sync written data
    fn finish(&mut self) -> PatchResult<()>;

    /// Whether writes land on the old image itself
    fn is_in_place(&self) -> bool;
}

fn write_at(file: &mut File, offset: u64, bytes: &[u8]) -> PatchResult<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(bytes)?;
    Ok(())
}

/// Writes over the old image, backing up old blocks before they are overwritten
#[derive(Debug)]
pub struct InPlaceTarget {
    file: File,
    old_layout: BlockLayout,
}

impl InPlaceTarget {
    /// Open the old image for in-place writing
    pub fn open(path: &Path, old_layout: BlockLayout) -> PatchResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self { file, old_layout })
    }
}

impl WriteTarget for InPlaceTarget {
    fn write_block(
        &mut self,
        offset: u64,
        bytes: &[u8],
        backups: &mut BlockBackupStore,
    ) -> PatchResult<()> {
        let range = offset..offset + bytes.len() as u64;
        for index in self.old_layout.blocks_overlapping(&range, backups.len()) {
            if let Some(block) = self.old_layout.block_range(index)
                && backups.ensure_backup(index, &mut self.file, block)?
            {
                trace!(block = index, write_offset = offset, "Backed up before overlapping write");
            }
        }
        write_at(&mut self.file, offset, bytes)
    }

    fn truncate(&mut self, len: u64) -> PatchResult<()> {
        self.file.set_len(len)?;
        Ok(())
    }

    fn finish(&mut self) -> PatchResult<()> {
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    fn is_in_place(&self) -> bool {
        true
    }
}

/// Writes into a separate file; the old image is only ever read
#[derive(Debug)]
pub struct NewFileTarget {
    file: File,
}

impl NewFileTarget {
    /// Create or truncate the output file
    pub fn create(path: &Path) -> PatchResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self { file })
    }
}

impl WriteTarget for NewFileTarget {
    fn write_block(
        &mut self,
        offset: u64,
        bytes: &[u8],
        _backups: &mut BlockBackupStore,
    ) -> PatchResult<()> {
        write_at(&mut self.file, offset, bytes)
    }

    fn truncate(&mut self, len: u64) -> PatchResult<()> {
        self.file.set_len(len)?;
        Ok(())
    }

    fn finish(&mut self) -> PatchResult<()> {
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    fn is_in_place(&self) -> bool {
        false
    }
}
