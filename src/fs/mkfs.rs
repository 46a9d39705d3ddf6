use std::path::Path;

use anyhow::{Context as _, Result};
use tokio::process::Command;

use super::cmd::CheckCommandOutput as _;

/// FAT32 for the EFI system partition; firmware reads nothing else.
pub async fn format_esp(dev: &Path) -> Result<()> {
    Command::new("mkfs.vfat")
        .args(["-F", "32", "-n", "EFI"])
        .arg(dev)
        .run()
        .await
        .with_context(|| format!("Failed to create FAT32 filesystem on {dev:?}"))?;
    Ok(())
}

/// btrfs on the decrypted root mapping.
pub async fn format_root(mapped_dev: &Path) -> Result<()> {
    Command::new("mkfs.btrfs")
        .args(["-f", "-L", "root"])
        .arg(mapped_dev)
        .run()
        .await
        .with_context(|| format!("Failed to create btrfs filesystem on {mapped_dev:?}"))?;
    Ok(())
}
