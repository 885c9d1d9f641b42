//! Block-wise OTA delta patch engine
//!
//! This crate reconstructs a new firmware image from an old image and a
//! delta patch, either into a separate file or in place over the old image.
//! Images are split into blocks; each block of the patch is one of:
//!
//! - **SKIP**: the old block is reused unchanged
//! - **MODIFY**: the block is rebuilt with a bsdiff-style control/diff/extra delta
//! - **ADD**: the block only exists in the new image
//! - **REMOVE**: the new image ends here
//!
//! Images may store their blocks raw or as independent LZMA streams. With
//! compression, block boundaries shift between images, so in-place patching
//! backs up every old block a write would overwrite before it is consumed.
//!
//! # Integrity
//!
//! The patch file carries a CRC over its whole body, checked before any
//! header is trusted. Every reconstructed block is checked against its
//! declared size and CRC before it is written.
//!
//! # Example
//!
//! ```no_run
//! use fota_delta::{PatchConfig, apply_patch};
//! use std::path::Path;
//!
//! # fn example() -> Result<(), fota_delta::PatchError> {
//! // Patch the old image in place
//! let report = apply_patch(
//!     Path::new("/dev/mtdblock1"),
//!     Path::new("/data/update.patch"),
//!     PatchConfig::default(),
//! )?;
//! println!("{} blocks rebuilt", report.blocks_modified);
//! # Ok(())
//! # }
//! ```

#![allow(clippy::cast_possible_truncation)] // Block sizes and offsets fit the on-disk u32 fields
#![allow(clippy::cast_possible_wrap)] // Control arithmetic on block-bounded positions
#![allow(clippy::cast_lossless)] // Sometimes clearer than From
#![allow(clippy::uninlined_format_args)] // Log messages read better with positional args
#![allow(clippy::doc_markdown)] // Format field names don't need backticks
#![allow(clippy::module_name_repetitions)] // Clear naming is preferred
#![allow(clippy::return_self_not_must_use)] // Builder patterns
#![allow(clippy::needless_pass_by_value)] // Configuration types
#![warn(missing_docs)]

pub mod backup;
pub mod bspatch;
pub mod checksum;
pub mod codec;
pub mod config;
pub mod error;
pub mod format;
pub mod image;
pub mod patcher;
pub mod reader;
pub mod target;

pub use backup::{BlockBackupStore, BlockStatus};
pub use codec::{CompressionCodec, LzmaCodec, codec_for};
pub use config::{ImageFraming, PatchArgs, PatchConfig, PatchMode};
pub use error::{PatchError, PatchResult};
pub use format::{BlockDiffHeader, CompressionFormat, CompressionHeader, PatchHeader, Token};
pub use image::{BlockLayout, ImageMetadata, OldImage};
pub use patcher::{PatchReport, PatchSession, apply_patch};
pub use reader::{PatchFileReader, SectionKind};
pub use target::{InPlaceTarget, NewFileTarget, WriteTarget};
