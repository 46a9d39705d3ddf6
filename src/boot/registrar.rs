//! Boot-manager configuration and firmware boot-entry registration.

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use tokio::process::Command;

use crate::{capability::Capabilities, fs::cmd::CheckCommandOutput as _};

/// A firmware boot entry pointing at a loader on the ESP.
#[derive(Debug, Clone)]
pub struct BootEntry {
    pub label: String,
    /// Loader path in EFI notation (backslashes, relative to the ESP root).
    pub loader: String,
    pub disk: PathBuf,
    pub partition: u32,
}

/// Install the boot manager onto the ESP.
pub async fn install_boot_manager() -> Result<()> {
    Command::new("bootctl")
        .arg("install")
        .run()
        .await
        .context("Failed to install the boot manager onto the ESP")?;
    Ok(())
}

/// Write the boot manager's default-entry/timeout configuration. UKIs under
/// EFI/Linux are auto-discovered; the config only picks the default.
pub async fn write_loader_config(esp_root: &Path, default_entry: &str, timeout_sec: u32) -> Result<()> {
    let loader_dir = esp_root.join("loader");
    tokio::fs::create_dir_all(&loader_dir)
        .await
        .with_context(|| format!("Failed to create {loader_dir:?}"))?;

    let config = format!(
        "default {default_entry}\ntimeout {timeout_sec}\nconsole-mode max\neditor no\n"
    );
    let path = loader_dir.join("loader.conf");
    tokio::fs::write(&path, config)
        .await
        .with_context(|| format!("Failed to write {path:?}"))?;

    Ok(())
}

/// Write a boot-entry descriptor under loader/entries, naming the image the
/// entry boots. For a unified image the command line is embedded in the image
/// itself, so the descriptor only carries title and loader path.
pub async fn write_boot_entry(
    esp_root: &Path,
    entry_file: &str,
    title: &str,
    efi_path: &str,
) -> Result<()> {
    let entries_dir = esp_root.join("loader/entries");
    tokio::fs::create_dir_all(&entries_dir)
        .await
        .with_context(|| format!("Failed to create {entries_dir:?}"))?;

    let entry = format!("title {title}\nefi {efi_path}\n");
    let path = entries_dir.join(entry_file);
    tokio::fs::write(&path, entry)
        .await
        .with_context(|| format!("Failed to write {path:?}"))?;

    Ok(())
}

/// Register a firmware boot variable for the entry. Environments without
/// efivars support (VMs, chroots on some hosts) only get a warning; the
/// installation stays valid, it just will not auto-boot.
pub async fn register_firmware_entry(entry: &BootEntry, caps: &Capabilities) -> Result<()> {
    if !caps.firmware_entries {
        tracing::warn!(
            label = entry.label,
            "firmware boot entries are unsupported here; register {} manually \
             from the firmware setup if needed",
            entry.loader
        );
        return Ok(());
    }

    let result = Command::new("efibootmgr")
        .arg("--create")
        .arg("--disk")
        .arg(&entry.disk)
        .arg("--part")
        .arg(entry.partition.to_string())
        .arg("--label")
        .arg(&entry.label)
        .arg("--loader")
        .arg(&entry.loader)
        .run()
        .await;

    match result {
        Ok(_) => {
            tracing::info!(label = entry.label, "registered firmware boot entry");
            Ok(())
        }
        Err(e) => {
            tracing::warn!(
                label = entry.label,
                "failed to register the firmware boot entry; the installation \
                 remains bootable via the boot manager fallback path: {e:#}"
            );
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loader_config_contains_default_and_timeout() {
        let dir = tempfile::tempdir().unwrap();
        write_loader_config(dir.path(), "linux.efi", 3).await.unwrap();

        let content =
            tokio::fs::read_to_string(dir.path().join("loader/loader.conf")).await.unwrap();
        assert!(content.contains("default linux.efi"));
        assert!(content.contains("timeout 3"));
    }

    #[tokio::test]
    async fn boot_entry_descriptor_names_title_and_image() {
        let dir = tempfile::tempdir().unwrap();
        write_boot_entry(dir.path(), "linux.conf", "anvil", "/EFI/Linux/linux.efi")
            .await
            .unwrap();

        let content =
            tokio::fs::read_to_string(dir.path().join("loader/entries/linux.conf"))
                .await
                .unwrap();
        assert!(content.contains("title anvil"));
        assert!(content.contains("efi /EFI/Linux/linux.efi"));
    }
}
