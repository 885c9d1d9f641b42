//! Patch engine configuration.
//!
//! Configuration can be provided via:
//! - CLI arguments (`fota-patch OLD PATCH [NEW] --raw --crc-chunk-size N`)
//! - Environment variables (`FOTA_PATCH_RAW`, `FOTA_PATCH_CRC_CHUNK_SIZE`, ...)
//! - The [`PatchConfig`] builder when used as a library
//!
//! # Example
//!
//! ```no_run
//! use fota_delta::{ImageFraming, PatchConfig};
//!
//! let config = PatchConfig::default()
//!     .to_new_file("firmware.new")
//!     .with_framing(ImageFraming::Framed);
//! config.validate().expect("Invalid configuration");
//! ```

use crate::checksum::CRC_BLOCKSIZE;
use crate::error::{PatchError, PatchResult};
use clap::Parser;
use std::path::{Path, PathBuf};

/// Where the reconstructed image is written
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PatchMode {
    /// Overwrite the old image's storage
    #[default]
    InPlace,
    /// Write a separate file, leaving the old image untouched
    ToNewFile(PathBuf),
}

/// Metadata framing of the images
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImageFraming {
    /// `[crc][binary header][compression header?][blocks]`
    #[default]
    Framed,
    /// Bare blocks with no metadata (kernel partition images)
    Raw,
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchConfig {
    /// Destination mode
    pub mode: PatchMode,
    /// Image framing
    pub framing: ImageFraming,
    /// Chunk size used while verifying the whole-file CRC
    pub crc_chunk_size: usize,
}

impl Default for PatchConfig {
    fn default() -> Self {
        Self {
            mode: PatchMode::InPlace,
            framing: ImageFraming::Framed,
            crc_chunk_size: CRC_BLOCKSIZE,
        }
    }
}

impl PatchConfig {
    /// Set the destination mode
    pub fn with_mode(mut self, mode: PatchMode) -> Self {
        self.mode = mode;
        self
    }

    /// Patch the old image in place
    pub fn in_place(self) -> Self {
        self.with_mode(PatchMode::InPlace)
    }

    /// Write the new image to `path`
    pub fn to_new_file(self, path: impl Into<PathBuf>) -> Self {
        self.with_mode(PatchMode::ToNewFile(path.into()))
    }

    /// Set the image framing
    pub fn with_framing(mut self, framing: ImageFraming) -> Self {
        self.framing = framing;
        self
    }

    /// Set the CRC verification chunk size
    pub fn with_crc_chunk_size(mut self, size: usize) -> Self {
        self.crc_chunk_size = size;
        self
    }

    /// Whether the destination is the old image itself
    pub fn is_in_place(&self) -> bool {
        matches!(self.mode, PatchMode::InPlace)
    }

    /// Validate configuration.
    ///
    /// Returns `PatchError::Config` if:
    /// - the CRC chunk size is zero
    /// - raw framing is combined with in-place patching
    pub fn validate(&self) -> PatchResult<()> {
        if self.crc_chunk_size == 0 {
            return Err(PatchError::Config(
                "CRC chunk size must be non-zero".to_string(),
            ));
        }

        if self.framing == ImageFraming::Raw && self.is_in_place() {
            return Err(PatchError::Config(
                "raw images can only be patched into a new file".to_string(),
            ));
        }

        Ok(())
    }
}

/// Command-line arguments of the `fota-patch` binary
#[derive(Debug, Clone, Parser)]
#[command(
    name = "fota-patch",
    about = "Apply a block-wise OTA delta patch to a firmware image",
    version
)]
pub struct PatchArgs {
    /// Old image, patched in place unless NEW is given
    pub old: PathBuf,

    /// Patch file
    pub patch: PathBuf,

    /// Output image (leaves OLD untouched)
    pub new: Option<PathBuf>,

    /// Treat images as raw partitions without CRC or headers
    #[arg(long, env = "FOTA_PATCH_RAW")]
    pub raw: bool,

    /// Chunk size used to verify the patch CRC
    #[arg(long, env = "FOTA_PATCH_CRC_CHUNK_SIZE", default_value_t = CRC_BLOCKSIZE)]
    pub crc_chunk_size: usize,

    /// Verify the patch against OLD without writing anything
    #[arg(long, env = "FOTA_PATCH_VERIFY_ONLY")]
    pub verify_only: bool,
}

impl PatchArgs {
    /// Parse arguments from the command line.
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Build the engine configuration these arguments describe
    pub fn to_config(&self) -> PatchConfig {
        let mode = self
            .new
            .as_ref()
            .map_or(PatchMode::InPlace, |path| PatchMode::ToNewFile(path.clone()));
        let framing = if self.raw {
            ImageFraming::Raw
        } else {
            ImageFraming::Framed
        };

        PatchConfig::default()
            .with_mode(mode)
            .with_framing(framing)
            .with_crc_chunk_size(self.crc_chunk_size)
    }

    /// Old image path
    pub fn old_path(&self) -> &Path {
        &self.old
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PatchConfig::default();
        assert!(config.is_in_place());
        assert_eq!(config.framing, ImageFraming::Framed);
        assert_eq!(config.crc_chunk_size, 4096);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        let config = PatchConfig::default().with_crc_chunk_size(0);
        assert!(matches!(config.validate(), Err(PatchError::Config(_))));
    }

    #[test]
    fn test_raw_requires_new_file() {
        let in_place = PatchConfig::default().with_framing(ImageFraming::Raw);
        assert!(in_place.validate().is_err());

        let to_file = in_place.to_new_file("/tmp/kernel.new");
        assert!(to_file.validate().is_ok());
        assert_eq!(
            to_file.mode,
            PatchMode::ToNewFile(PathBuf::from("/tmp/kernel.new"))
        );
    }

    #[test]
    fn test_cli_two_argument_form_patches_in_place() {
        let args = PatchArgs::try_parse_from(["fota-patch", "old.bin", "delta.patch"])
            .expect("Operation should succeed");
        let config = args.to_config();
        assert!(config.is_in_place());
        assert!(!args.verify_only);
        assert_eq!(args.old_path(), Path::new("old.bin"));
    }

    #[test]
    fn test_cli_three_argument_form() {
        let args = PatchArgs::try_parse_from([
            "fota-patch",
            "old.bin",
            "delta.patch",
            "new.bin",
            "--raw",
            "--crc-chunk-size",
            "512",
        ])
        .expect("Operation should succeed");
        let config = args.to_config();

        assert_eq!(config.mode, PatchMode::ToNewFile(PathBuf::from("new.bin")));
        assert_eq!(config.framing, ImageFraming::Raw);
        assert_eq!(config.crc_chunk_size, 512);
    }
}
