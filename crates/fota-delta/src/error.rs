//! Error types for patch application
//!
//! Every failure is fatal for the running session. The variants mirror the
//! stages at which a patch can be rejected: before any write (format and
//! patching-condition errors) or part way through the block loop (corruption
//! and block integrity errors).

use thiserror::Error;

/// Patch engine error types
#[derive(Error, Debug)]
pub enum PatchError {
    /// Filesystem open/seek/read/write/truncate failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Bad magic, out-of-range enum value or malformed fixed-size structure
    #[error("Invalid patch format: {0}")]
    Format(String),

    /// Whole-file CRC mismatch, malformed control data or short sub-stream read
    #[error("Corrupt patch data: {reason}")]
    CorruptPatch {
        /// Description of the corruption
        reason: String,
    },

    /// A reconstructed block disagrees with its declared size or CRC
    #[error("Integrity check failed for block {block}: {reason}")]
    BlockIntegrity {
        /// Index of the offending block
        block: u32,
        /// What did not match
        reason: String,
    },

    /// Old and new images cannot be patched against each other
    #[error("Patching condition not met: {0}")]
    PatchingCondition(String),

    /// Block codec failure
    #[error("Compression error: {0}")]
    Compression(String),

    /// Invalid engine configuration
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Result type for patch operations
pub type PatchResult<T> = Result<T, PatchError>;

impl PatchError {
    /// Create a format error
    pub fn format<S: Into<String>>(reason: S) -> Self {
        Self::Format(reason.into())
    }

    /// Create a corrupt patch error with a reason
    pub fn corrupt_patch<S: Into<String>>(reason: S) -> Self {
        Self::CorruptPatch {
            reason: reason.into(),
        }
    }

    /// Create a block integrity error
    pub fn block_integrity<S: Into<String>>(block: u32, reason: S) -> Self {
        Self::BlockIntegrity {
            block,
            reason: reason.into(),
        }
    }

    /// Create a patching condition error
    pub fn patching_condition<S: Into<String>>(reason: S) -> Self {
        Self::PatchingCondition(reason.into())
    }

    /// Create a compression error
    pub fn compression<S: Into<String>>(reason: S) -> Self {
        Self::Compression(reason.into())
    }

    /// Map a read failure on a patch sub-stream to a corruption error.
    ///
    /// A sub-stream that ends early or fails to inflate means the patch is
    /// damaged, not that the filesystem misbehaved.
    pub fn from_stream_read(what: &str, error: &std::io::Error) -> Self {
        Self::corrupt_patch(format!("{what}: {error}"))
    }

    /// Check if this error indicates corrupt or invalid patch data
    pub fn is_corruption_error(&self) -> bool {
        matches!(
            self,
            Self::CorruptPatch { .. } | Self::BlockIntegrity { .. } | Self::Format(_)
        )
    }

    /// Check if this error was raised before any destination byte could be written
    pub fn is_pre_write(&self) -> bool {
        matches!(
            self,
            Self::Format(_) | Self::PatchingCondition(_) | Self::Config(_)
        )
    }
}

impl From<binrw::Error> for PatchError {
    fn from(error: binrw::Error) -> Self {
        match error {
            binrw::Error::Backtrace(backtrace) => Self::from(*backtrace.error),
            binrw::Error::Io(io) => Self::Io(io),
            binrw::Error::AssertFail { message, .. } => Self::Format(message),
            binrw::Error::BadMagic { .. } => Self::format("signature mismatch"),
            other => Self::Format(other.to_string()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation_helpers() {
        let corrupt = PatchError::corrupt_patch("short control read");
        assert!(matches!(corrupt, PatchError::CorruptPatch { .. }));

        let integrity = PatchError::block_integrity(7, "crc mismatch");
        assert!(matches!(
            integrity,
            PatchError::BlockIntegrity { block: 7, .. }
        ));

        let condition = PatchError::patching_condition("blocksize differs");
        assert!(matches!(condition, PatchError::PatchingCondition(_)));
    }

    #[test]
    fn test_error_categorization() {
        assert!(PatchError::corrupt_patch("x").is_corruption_error());
        assert!(PatchError::block_integrity(0, "x").is_corruption_error());
        assert!(PatchError::format("x").is_corruption_error());
        assert!(!PatchError::patching_condition("x").is_corruption_error());

        assert!(PatchError::format("x").is_pre_write());
        assert!(PatchError::patching_condition("x").is_pre_write());
        assert!(!PatchError::corrupt_patch("x").is_pre_write());
    }

    #[test]
    fn test_error_display() {
        let error = PatchError::block_integrity(3, "size 10 != 12");
        let message = error.to_string();
        assert!(message.contains("block 3"));
        assert!(message.contains("size 10 != 12"));
    }

    #[test]
    fn test_stream_read_maps_to_corruption() {
        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        let error = PatchError::from_stream_read("diff stream", &io);
        assert!(error.is_corruption_error());
        assert!(error.to_string().contains("diff stream"));
    }
}
