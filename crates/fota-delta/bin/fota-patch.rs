//! fota-patch binary entry point.
//!
//! This is a thin wrapper around the fota-delta library that:
//! 1. Initializes logging
//! 2. Parses command-line arguments
//! 3. Verifies the patch against the old image
//! 4. Applies it, unless `--verify-only` was given
//!
//! For library usage, see the fota-delta crate documentation.

use anyhow::{Context, Result};
use fota_delta::{PatchArgs, PatchSession};

fn main() -> Result<()> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = PatchArgs::from_args();
    let config = args.to_config();

    tracing::info!(
        "Patch {} -> {:?} (framing {:?})",
        args.patch.display(),
        config.mode,
        config.framing
    );

    let session = PatchSession::open(args.old_path(), &args.patch, config).with_context(|| {
        format!(
            "patch {} does not apply to {}",
            args.patch.display(),
            args.old.display()
        )
    })?;

    if args.verify_only {
        let header = session.header();
        tracing::info!(
            "Patch verified: crc {:#010x}, {} -> {} blocks, compression {}",
            session.patch_crc(),
            header.blocks_oldfile,
            header.blocks_newfile,
            session.compression_format()
        );
        return Ok(());
    }

    let report = session
        .apply()
        .with_context(|| format!("failed to apply {}", args.patch.display()))?;

    tracing::info!("New image written: {} bytes", report.final_size);

    Ok(())
}
