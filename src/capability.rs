use std::path::Path;

use tokio::process::Command;

use crate::fs::cmd::CheckCommandOutput as _;

const EFIVARS_DIR: &str = "/sys/firmware/efi/efivars";

/// What the environment can actually do, probed once before the pipeline
/// starts and consulted by later stages instead of re-probing ad hoc.
///
/// Flags only ever degrade: a stage that loses a capability at runtime (e.g.
/// Secure Boot key creation fails) clears the flag for everything downstream.
#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    /// sbctl is available; key creation and signing can be attempted.
    pub secure_boot: bool,
    /// efivars are exposed and efibootmgr exists; firmware boot entries can
    /// be written. Typically absent in virtualized or chrooted environments.
    pub firmware_entries: bool,
    /// btrfs-progs is new enough to allocate swap files natively.
    pub btrfs_mkswapfile: bool,
}

pub async fn probe() -> Capabilities {
    let secure_boot = which::which("sbctl").is_ok();

    let firmware_entries =
        which::which("efibootmgr").is_ok() && Path::new(EFIVARS_DIR).is_dir();

    let btrfs_mkswapfile = match which::which("btrfs") {
        Ok(_) => Command::new("btrfs")
            .args(["filesystem", "mkswapfile", "--help"])
            .run_with_status_checker(|code, _, _| Ok(code == 0))
            .await
            .unwrap_or(false),
        Err(_) => false,
    };

    let caps = Capabilities {
        secure_boot,
        firmware_entries,
        btrfs_mkswapfile,
    };
    tracing::debug!(?caps, "probed environment capabilities");
    caps
}
