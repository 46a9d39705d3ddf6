use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use tokio::process::Command;

use crate::capability::Capabilities;

use super::cmd::CheckCommandOutput as _;

pub const SWAP_FILE: &str = "swapfile";

/// Allocate and activate a swap file on the btrfs root.
///
/// Swap pages must not go through copy-on-write or compression, so the file
/// is either allocated with `btrfs filesystem mkswapfile` (which handles the
/// attributes itself) or, when that is unavailable, created empty, marked
/// no-COW before any data is written, and only then filled.
pub async fn provision(root: &Path, size_gib: u32, caps: &Capabilities) -> Result<PathBuf> {
    let swapfile = root.join(SWAP_FILE);

    // A leftover file from a previous attempt is a precondition to clear,
    // not an error.
    if tokio::fs::try_exists(&swapfile).await? {
        tracing::info!(?swapfile, "removing existing swap file before re-provisioning");
        let _ = Command::new("swapoff").arg(&swapfile).run().await;
        tokio::fs::remove_file(&swapfile)
            .await
            .with_context(|| format!("Failed to remove stale swap file {swapfile:?}"))?;
    }

    if caps.btrfs_mkswapfile {
        Command::new("btrfs")
            .args(["filesystem", "mkswapfile", "--size"])
            .arg(format!("{size_gib}g"))
            .arg(&swapfile)
            .run()
            .await
            .context("Failed to allocate swap file natively")?;
    } else {
        allocate_manually(&swapfile, size_gib).await?;
    }

    set_permissions(&swapfile).await?;

    Command::new("swapon")
        .arg(&swapfile)
        .run()
        .await
        .with_context(|| format!("Failed to activate swap file {swapfile:?}"))?;

    Ok(swapfile)
}

async fn allocate_manually(swapfile: &Path, size_gib: u32) -> Result<()> {
    // The no-COW attribute only takes effect on an empty file, so the order
    // here is fixed: create empty, chattr +C, then fill.
    Command::new("truncate")
        .args(["-s", "0"])
        .arg(swapfile)
        .run()
        .await
        .context("Failed to create empty swap file")?;

    Command::new("chattr")
        .arg("+C")
        .arg(swapfile)
        .run()
        .await
        .context("Failed to mark swap file no-COW")?;

    Command::new("dd")
        .arg("if=/dev/zero")
        .arg(format!("of={}", swapfile.display()))
        .arg("bs=1M")
        .arg(format!("count={}", u64::from(size_gib) * 1024))
        .arg("status=none")
        .run()
        .await
        .context("Failed to zero-fill swap file")?;

    Command::new("mkswap")
        .arg(swapfile)
        .run()
        .await
        .context("Failed to format swap file")?;

    Ok(())
}

async fn set_permissions(swapfile: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt as _;

    tokio::fs::set_permissions(swapfile, std::fs::Permissions::from_mode(0o600))
        .await
        .with_context(|| format!("Failed to restrict permissions on {swapfile:?}"))
}
