//! Pre-image backups of old blocks
//!
//! Compressed blocks change size between images, so committing new block `i`
//! can overwrite bytes that still belong to old block `i + 1` or later. The
//! store captures such a block before the overlapping write and keeps it until
//! the block's own new bytes are committed.
//!
//! Each index moves through `NoBackup -> Backed -> Patched`. A patched block is
//! never captured again.

use crate::error::{PatchError, PatchResult};
use std::collections::BTreeMap;
use std::io::{Read, Seek, SeekFrom};
use std::ops::Range;
use tracing::{trace, warn};

/// Backup state of one block index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockStatus {
    /// Old bytes are still live on the device
    #[default]
    NoBackup,
    /// Old bytes are held in memory
    Backed,
    /// New bytes are committed, old bytes are no longer needed
    Patched,
}

/// Per-block backup buffers and patched flags
#[derive(Debug, Default)]
pub struct BlockBackupStore {
    status: Vec<BlockStatus>,
    buffers: BTreeMap<u32, Vec<u8>>,
    backups_taken: u32,
    live_bytes: u64,
    peak_bytes: u64,
    warn_threshold: Option<u64>,
    warned: bool,
}

impl BlockBackupStore {
    /// Create a store tracking blocks `0..blocks`
    pub fn new(blocks: u32) -> Self {
        Self {
            status: vec![BlockStatus::NoBackup; blocks as usize],
            ..Self::default()
        }
    }

    /// Warn once when live backup memory grows past `bytes`
    pub fn with_warn_threshold(mut self, bytes: u64) -> Self {
        self.warn_threshold = Some(bytes);
        self
    }

    /// Number of tracked block indices
    pub fn len(&self) -> u32 {
        self.status.len() as u32
    }

    /// Whether the store tracks no blocks at all
    pub fn is_empty(&self) -> bool {
        self.status.is_empty()
    }

    /// Status of block `index`; untracked indices report `Patched`
    pub fn status(&self, index: u32) -> BlockStatus {
        self.status
            .get(index as usize)
            .copied()
            .unwrap_or(BlockStatus::Patched)
    }

    /// Whether block `index` has been committed
    pub fn is_patched(&self, index: u32) -> bool {
        self.status(index) == BlockStatus::Patched
    }

    /// Capture `range` of `source` as the pre-image of block `index`.
    ///
    /// No-op if the block is already backed up, already patched, or not
    /// tracked. Returns whether a capture happened.
    pub fn ensure_backup<R: Read + Seek>(
        &mut self,
        index: u32,
        source: &mut R,
        range: Range<u64>,
    ) -> PatchResult<bool> {
        if self.status(index) != BlockStatus::NoBackup {
            return Ok(false);
        }

        let len = range.end.saturating_sub(range.start);
        let mut buffer = vec![0u8; len as usize];
        source.seek(SeekFrom::Start(range.start))?;
        source.read_exact(&mut buffer)?;

        trace!(block = index, offset = range.start, len, "Captured block backup");

        self.buffers.insert(index, buffer);
        self.status[index as usize] = BlockStatus::Backed;
        self.backups_taken += 1;
        self.live_bytes += len;
        self.peak_bytes = self.peak_bytes.max(self.live_bytes);

        if let Some(threshold) = self.warn_threshold
            && !self.warned
            && self.live_bytes > threshold
        {
            warn!(
                live_bytes = self.live_bytes,
                threshold, "Backup memory exceeds the size of the old image"
            );
            self.warned = true;
        }

        Ok(true)
    }

    /// Pre-image of block `index`
    pub fn get_backup(&self, index: u32) -> PatchResult<&[u8]> {
        self.buffers
            .get(&index)
            .map(Vec::as_slice)
            .ok_or_else(|| PatchError::corrupt_patch(format!("no backup held for block {index}")))
    }

    /// Release the backup of block `index` and mark it committed. Idempotent.
    pub fn mark_patched(&mut self, index: u32) {
        if let Some(buffer) = self.buffers.remove(&index) {
            self.live_bytes -= buffer.len() as u64;
        }
        if let Some(status) = self.status.get_mut(index as usize) {
            *status = BlockStatus::Patched;
        }
    }

    /// Number of captures performed
    pub fn backups_taken(&self) -> u32 {
        self.backups_taken
    }

    /// Bytes currently held
    pub fn live_bytes(&self) -> u64 {
        self.live_bytes
    }

    /// Largest amount of backup memory held at once
    pub fn peak_bytes(&self) -> u64 {
        self.peak_bytes
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn device() -> Cursor<Vec<u8>> {
        Cursor::new((0..=255u8).cycle().take(1024).collect())
    }

    #[test]
    fn test_state_transitions() {
        let mut store = BlockBackupStore::new(4);
        let mut source = device();

        assert_eq!(store.status(1), BlockStatus::NoBackup);
        assert!(store.ensure_backup(1, &mut source, 256..512).unwrap());
        assert_eq!(store.status(1), BlockStatus::Backed);
        assert_eq!(store.get_backup(1).unwrap()[0], 0);
        assert_eq!(store.get_backup(1).unwrap().len(), 256);

        // Second capture keeps the original pre-image
        source.get_mut()[256] = 0xFF;
        assert!(!store.ensure_backup(1, &mut source, 256..512).unwrap());
        assert_eq!(store.get_backup(1).unwrap()[0], 0);

        store.mark_patched(1);
        assert!(store.is_patched(1));
        assert!(store.get_backup(1).is_err());

        // Patched blocks are never captured again
        assert!(!store.ensure_backup(1, &mut source, 256..512).unwrap());
        store.mark_patched(1);
        assert_eq!(store.backups_taken(), 1);
    }

    #[test]
    fn test_memory_accounting() {
        let mut store = BlockBackupStore::new(3).with_warn_threshold(300);
        let mut source = device();

        store.ensure_backup(0, &mut source, 0..200).unwrap();
        store.ensure_backup(2, &mut source, 400..600).unwrap();
        assert_eq!(store.live_bytes(), 400);

        store.mark_patched(0);
        assert_eq!(store.live_bytes(), 200);
        assert_eq!(store.peak_bytes(), 400);
    }

    #[test]
    fn test_untracked_indices() {
        let mut store = BlockBackupStore::new(2);
        let mut source = device();

        assert!(store.is_patched(5));
        assert!(!store.ensure_backup(5, &mut source, 0..10).unwrap());
        store.mark_patched(5);
        assert_eq!(store.len(), 2);
        assert!(!store.is_empty());
    }

    #[test]
    fn test_short_source_fails() {
        let mut store = BlockBackupStore::new(1);
        let mut source = device();

        let result = store.ensure_backup(0, &mut source, 1000..1100);
        assert!(matches!(result, Err(PatchError::Io(_))));
        assert_eq!(store.status(0), BlockStatus::NoBackup);
    }
}
