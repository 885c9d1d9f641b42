//! Fixture builder shared by the integration tests.
//!
//! Builds old/new images from lists of plain blocks and writes a patch between
//! them using the same wire format the engine reads: whole-file CRC, patch
//! header, new image metadata and one record per block with gzip-wrapped
//! control/diff/extra sections.

#![allow(dead_code, clippy::expect_used, clippy::unwrap_used)]

use binrw::BinWrite;
use flate2::Compression;
use flate2::write::GzEncoder;
use fota_delta::bspatch::ControlTriple;
use fota_delta::checksum::crc32;
use fota_delta::format::PATCH_SIGNATURE;
use fota_delta::{
    BlockDiffHeader, CompressionCodec, CompressionFormat, CompressionHeader, ImageFraming,
    LzmaCodec, PatchHeader, Token,
};
use std::io::{Cursor, Write};
use std::path::PathBuf;
use tempfile::TempDir;

/// Width of the image CRC field in framed fixtures
pub const CRC_WIDTH: u32 = 4;

/// Width of the binary header in framed fixtures
pub const BINARY_HEADER_WIDTH: u32 = 8;

/// Deterministic pseudo-random block content
pub fn block(seed: u32, len: usize) -> Vec<u8> {
    let mut state = seed.wrapping_mul(2_654_435_761).wrapping_add(1);
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state >> 24) as u8
        })
        .collect()
}

/// Block content that compresses well
pub fn compressible_block(seed: u8, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| seed.wrapping_add((i / 64) as u8))
        .collect()
}

/// Copy of `base` with a few bytes changed
pub fn tweak(base: &[u8], at: &[usize]) -> Vec<u8> {
    let mut out = base.to_vec();
    for &i in at {
        out[i] = out[i].wrapping_add(0x5A);
    }
    out
}

/// Encode a gzip member
pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// Control, diff and extra streams for one block
#[derive(Debug, Clone, Default)]
pub struct BlockDelta {
    pub ctrl: Vec<u8>,
    pub diff: Vec<u8>,
    pub extra: Vec<u8>,
}

impl BlockDelta {
    /// Delta that diffs the common prefix and copies the tail verbatim
    pub fn between(old: &[u8], new: &[u8]) -> Self {
        let common = old.len().min(new.len());
        let diff = new[..common]
            .iter()
            .zip(&old[..common])
            .map(|(n, o)| n.wrapping_sub(*o))
            .collect();

        let mut ctrl = Vec::new();
        if !new.is_empty() {
            let triple = ControlTriple::new(common as i64, (new.len() - common) as i64, 0);
            ctrl.extend_from_slice(&triple.to_bytes());
        }

        Self {
            ctrl,
            diff,
            extra: new[common..].to_vec(),
        }
    }
}

/// Old/new image pair and the patch between them
#[derive(Debug, Clone)]
pub struct Fixture {
    pub format: CompressionFormat,
    pub framing: ImageFraming,
    pub blocksize: u32,
    pub old_blocks: Vec<Vec<u8>>,
    pub new_blocks: Vec<Vec<u8>>,
    pub old_binary_header: Vec<u8>,
    pub new_binary_header: Vec<u8>,
}

impl Fixture {
    pub fn new(
        format: CompressionFormat,
        blocksize: u32,
        old_blocks: Vec<Vec<u8>>,
        new_blocks: Vec<Vec<u8>>,
    ) -> Self {
        Self {
            format,
            framing: ImageFraming::Framed,
            blocksize,
            old_blocks,
            new_blocks,
            old_binary_header: b"FWv1.0.0".to_vec(),
            new_binary_header: b"FWv1.1.0".to_vec(),
        }
    }

    /// Raw partition images: no metadata, no compression
    pub fn raw(mut self) -> Self {
        self.framing = ImageFraming::Raw;
        self
    }

    fn codec(&self) -> Option<LzmaCodec> {
        self.format.is_compressed().then(LzmaCodec::default)
    }

    fn stored(&self, plain: &[u8]) -> Vec<u8> {
        match self.codec() {
            Some(codec) => codec.encode(plain, self.blocksize).unwrap(),
            None => plain.to_vec(),
        }
    }

    pub fn stored_blocks(&self, blocks: &[Vec<u8>]) -> Vec<Vec<u8>> {
        blocks.iter().map(|b| self.stored(b)).collect()
    }

    fn compression_header(&self, plain: &[Vec<u8>], stored: &[Vec<u8>]) -> CompressionHeader {
        let sizes: Vec<u32> = stored.iter().map(|b| b.len() as u32).collect();
        let binary_size = plain.iter().map(Vec::len).sum::<usize>() as u32;
        CompressionHeader::from_block_sizes(self.format, self.blocksize, binary_size, &sizes)
    }

    fn metadata(&self, plain: &[Vec<u8>], stored: &[Vec<u8>], binary_header: &[u8]) -> Vec<u8> {
        if self.framing == ImageFraming::Raw {
            return Vec::new();
        }

        let payload: Vec<u8> = stored.concat();
        let mut out = crc32(0, &payload).to_le_bytes().to_vec();
        out.extend_from_slice(binary_header);
        if self.format.is_compressed() {
            let mut cursor = Cursor::new(Vec::new());
            self.compression_header(plain, stored)
                .write(&mut cursor)
                .unwrap();
            out.extend(cursor.into_inner());
        }
        out
    }

    fn image(&self, plain: &[Vec<u8>], binary_header: &[u8]) -> Vec<u8> {
        let stored = self.stored_blocks(plain);
        let mut image = self.metadata(plain, &stored, binary_header);
        image.extend(stored.concat());
        image
    }

    pub fn old_image(&self) -> Vec<u8> {
        self.image(&self.old_blocks, &self.old_binary_header)
    }

    pub fn new_image(&self) -> Vec<u8> {
        self.image(&self.new_blocks, &self.new_binary_header)
    }

    /// Records chosen automatically: SKIP for identical blocks, MODIFY for
    /// changed ones, ADD past the old image and REMOVE past the new one
    pub fn records(&self) -> Vec<(BlockDiffHeader, Vec<Vec<u8>>)> {
        let old_stored = self.stored_blocks(&self.old_blocks);
        let new_stored = self.stored_blocks(&self.new_blocks);
        let total = self.old_blocks.len().max(self.new_blocks.len());
        let compressed = self.format.is_compressed();

        (0..total)
            .map(|i| {
                let mut header = BlockDiffHeader {
                    block_number: i as u32,
                    token: Token::Remove,
                    new_block_size_u: 0,
                    new_block_size_c: 0,
                    new_block_crc: 0,
                    size_ctrl_block: 0,
                    size_diff_block: 0,
                    size_extra_block: 0,
                };

                let Some(new_plain) = self.new_blocks.get(i) else {
                    return (header, Vec::new());
                };
                header.new_block_size_u = new_plain.len() as u32;
                header.new_block_size_c = if compressed {
                    new_stored[i].len() as u32
                } else {
                    0
                };
                header.new_block_crc = crc32(0, &new_stored[i]);

                let sections = match self.old_blocks.get(i) {
                    Some(_) if old_stored[i] == new_stored[i] => {
                        header.token = Token::Skip;
                        Vec::new()
                    }
                    Some(old_plain) => {
                        header.token = Token::Modify;
                        let delta = BlockDelta::between(old_plain, new_plain);
                        vec![gzip(&delta.ctrl), gzip(&delta.diff), gzip(&delta.extra)]
                    }
                    None => {
                        header.token = Token::Add;
                        vec![gzip(new_plain)]
                    }
                };

                if let [ctrl, diff, extra] = sections.as_slice() {
                    header.size_ctrl_block = ctrl.len() as u32;
                    header.size_diff_block = diff.len() as u32;
                    header.size_extra_block = extra.len() as u32;
                } else if let [extra] = sections.as_slice() {
                    header.size_extra_block = extra.len() as u32;
                }

                (header, sections)
            })
            .collect()
    }

    pub fn patch_header(&self) -> PatchHeader {
        let framed = self.framing == ImageFraming::Framed;
        let comp_header_size = if self.format.is_compressed() {
            CompressionHeader::encoded_size(self.new_blocks.len() as u32) as u32
        } else {
            0
        };

        PatchHeader {
            signature: PATCH_SIGNATURE,
            old_file_compression_format: self.format.as_raw(),
            blocks_oldfile: self.old_blocks.len() as u32,
            blocks_newfile: self.new_blocks.len() as u32,
            blocksize_oldfile: self.blocksize,
            blocksize_newfile: self.blocksize,
            crc_newfile_size: if framed { CRC_WIDTH } else { 0 },
            binary_header_size: if framed { BINARY_HEADER_WIDTH } else { 0 },
            comp_header_size,
        }
    }

    /// Patch with automatically chosen records
    pub fn patch(&self) -> Vec<u8> {
        self.patch_from(&self.patch_header(), &self.records())
    }

    /// Patch with each record passed through `edit` before encoding
    pub fn patch_with<F>(&self, mut edit: F) -> Vec<u8>
    where
        F: FnMut(&mut BlockDiffHeader, &mut Vec<Vec<u8>>),
    {
        let mut records = self.records();
        for (header, sections) in &mut records {
            edit(header, sections);
        }
        self.patch_from(&self.patch_header(), &records)
    }

    /// Encode a patch from explicit parts, with a correct whole-file CRC
    pub fn patch_from(
        &self,
        header: &PatchHeader,
        records: &[(BlockDiffHeader, Vec<Vec<u8>>)],
    ) -> Vec<u8> {
        let new_stored = self.stored_blocks(&self.new_blocks);
        let mut body = Cursor::new(Vec::new());
        header.write(&mut body).unwrap();
        body.write_all(&self.metadata(&self.new_blocks, &new_stored, &self.new_binary_header))
            .unwrap();

        for (record, sections) in records {
            record.write(&mut body).unwrap();
            for section in sections {
                body.write_all(section).unwrap();
            }
        }

        let body = body.into_inner();
        let mut patch = crc32(0, &body).to_le_bytes().to_vec();
        patch.extend(body);
        patch
    }
}

/// Temporary directory holding an old image and a patch
pub struct Workspace {
    pub dir: TempDir,
    pub old: PathBuf,
    pub patch: PathBuf,
    pub new: PathBuf,
}

impl Workspace {
    pub fn new(old_image: &[u8], patch: &[u8]) -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let old = dir.path().join("firmware.bin");
        let patch_path = dir.path().join("update.patch");
        let new = dir.path().join("firmware.new");
        std::fs::write(&old, old_image).expect("Failed to write old image");
        std::fs::write(&patch_path, patch).expect("Failed to write patch");
        Self {
            dir,
            old,
            patch: patch_path,
            new,
        }
    }

    pub fn for_fixture(fixture: &Fixture) -> Self {
        Self::new(&fixture.old_image(), &fixture.patch())
    }

    pub fn read_old(&self) -> Vec<u8> {
        std::fs::read(&self.old).expect("Failed to read old image")
    }

    pub fn read_new(&self) -> Vec<u8> {
        std::fs::read(&self.new).expect("Failed to read new image")
    }
}
