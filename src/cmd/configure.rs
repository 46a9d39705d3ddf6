//! The second stage, executed inside the new root through the chroot handoff.
//!
//! Everything here consumes the frozen parameter record written by the outer
//! stage; the only value derived locally is the root partition UUID, which is
//! needed for the kernel command line and is only resolvable in here.

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use tokio::process::Command;

use crate::{
    boot::{
        registrar::{self, BootEntry},
        secureboot::{SecureBootKeys, SigningTarget},
        uki::{self, UkiSpec},
    },
    capability,
    cli::ConfigureOptions,
    config::StageParams,
    fs::{self, cmd::CheckCommandOutput as _},
    system,
    types::CpuVendor,
};

use super::provision::ROOT_MAPPING;

const ESP_ROOT: &str = "/boot";
const UKI_DIR: &str = "/boot/EFI/Linux";
const PRIMARY_UKI: &str = "linux.efi";
const FALLBACK_UKI: &str = "linux-fallback.efi";

const KERNEL: &str = "/boot/vmlinuz-linux";
const INITRD: &str = "/boot/initramfs-linux.img";
const FALLBACK_INITRD: &str = "/boot/initramfs-linux-fallback.img";
const STUB: &str = "/usr/lib/systemd/boot/efi/linuxx64.efi.stub";
const OS_RELEASE: &str = "/usr/lib/os-release";

const BOOT_MENU_TIMEOUT_SEC: u32 = 3;

pub struct ConfigureCommand {
    pub configure_options: ConfigureOptions,
}

#[async_trait]
impl super::Command for ConfigureCommand {
    async fn run(&self) -> Result<()> {
        let params = StageParams::load(&self.configure_options.params).await?;
        let mut caps = capability::probe().await;

        system::set_identity(&params.identity).await?;
        system::set_locale(&params.identity).await?;
        system::set_timezone(&params.identity).await?;
        system::set_credentials(&params.identity, &params.credentials).await?;
        system::rebuild_initramfs().await?;
        system::enable_services(&params.services).await?;

        if params.swap_size_gib > 0 {
            let swapfile =
                fs::swap::provision(Path::new("/"), params.swap_size_gib, &caps).await?;
            fs::fstab::append_entry(
                Path::new("/etc/fstab"),
                &fs::fstab::swap_entry(&swapfile.display().to_string()),
            )
            .await?;
        }

        let uuid = root_uuid(&params.root_partition).await?;
        let cmdline = kernel_cmdline(&uuid);
        let microcode = resolve_microcode(params.hardware.cpu_vendor).await;

        tokio::fs::create_dir_all(UKI_DIR)
            .await
            .with_context(|| format!("Failed to create {UKI_DIR}"))?;

        let primary = PathBuf::from(UKI_DIR).join(PRIMARY_UKI);
        uki::build(&UkiSpec {
            os_release: PathBuf::from(OS_RELEASE),
            cmdline: cmdline.clone(),
            kernel: PathBuf::from(KERNEL),
            initrd: PathBuf::from(INITRD),
            microcode: microcode.clone(),
            stub: PathBuf::from(STUB),
            output: primary.clone(),
        })
        .await
        .context("Failed to build the primary boot image")?;

        // The fallback initrd skips hardware autodetection; it only exists on
        // standard kernel presets, so its absence is not an error.
        let fallback = PathBuf::from(UKI_DIR).join(FALLBACK_UKI);
        let have_fallback = tokio::fs::try_exists(FALLBACK_INITRD).await?;
        if have_fallback {
            uki::build(&UkiSpec {
                os_release: PathBuf::from(OS_RELEASE),
                cmdline,
                kernel: PathBuf::from(KERNEL),
                initrd: PathBuf::from(FALLBACK_INITRD),
                microcode,
                stub: PathBuf::from(STUB),
                output: fallback.clone(),
            })
            .await
            .context("Failed to build the fallback boot image")?;
        }

        registrar::install_boot_manager().await?;

        let keys = if caps.secure_boot {
            match SecureBootKeys::create().await {
                Ok(mut keys) => {
                    if let Err(e) = keys.enroll(params.enroll_vendor_keys).await {
                        tracing::warn!(
                            "key enrollment failed; signatures are still produced \
                             and the keys can be enrolled later: {e:#}"
                        );
                    }
                    Some(keys)
                }
                Err(e) => {
                    tracing::warn!(
                        "Secure Boot key creation failed; continuing with an \
                         unsigned boot chain: {e:#}"
                    );
                    caps.secure_boot = false;
                    None
                }
            }
        } else {
            tracing::warn!("Secure Boot tooling unavailable; the boot chain stays unsigned");
            None
        };

        if let Some(keys) = &keys {
            let mut targets = vec![SigningTarget { path: primary, critical: true }];
            if have_fallback {
                targets.push(SigningTarget { path: fallback, critical: false });
            }
            targets.push(SigningTarget {
                path: PathBuf::from("/boot/EFI/systemd/systemd-bootx64.efi"),
                critical: false,
            });
            targets.push(SigningTarget {
                path: PathBuf::from("/boot/EFI/BOOT/BOOTX64.EFI"),
                critical: false,
            });
            keys.sign_all(&targets).await;

            if !keys.is_enrolled() {
                tracing::warn!(
                    "keys are created but not enrolled; the firmware will not \
                     accept these signatures until `sbctl enroll-keys` is run"
                );
            }
        }

        registrar::write_loader_config(Path::new(ESP_ROOT), PRIMARY_UKI, BOOT_MENU_TIMEOUT_SEC)
            .await?;
        registrar::write_boot_entry(
            Path::new(ESP_ROOT),
            "linux.conf",
            &params.identity.hostname,
            &format!("/EFI/Linux/{PRIMARY_UKI}"),
        )
        .await?;

        registrar::register_firmware_entry(
            &BootEntry {
                label: params.identity.hostname.clone(),
                loader: format!("\\EFI\\Linux\\{PRIMARY_UKI}"),
                disk: params.disk.clone(),
                partition: 1,
            },
            &caps,
        )
        .await?;

        tracing::info!("second-stage configuration complete");

        Ok(())
    }
}

/// The kernel command line for an encrypted btrfs root: unlock the container
/// by partition UUID, then mount the root subvolume of the mapped device.
fn kernel_cmdline(root_uuid: &str) -> String {
    format!(
        "cryptdevice=UUID={root_uuid}:{ROOT_MAPPING} \
         root=/dev/mapper/{ROOT_MAPPING} rootflags=subvol=@ rw"
    )
}

async fn root_uuid(root_partition: &Path) -> Result<String> {
    let stdout = Command::new("blkid")
        .args(["-s", "UUID", "-o", "value"])
        .arg(root_partition)
        .run()
        .await
        .with_context(|| format!("Failed to read the UUID of {root_partition:?}"))?;
    let uuid = String::from_utf8_lossy(&stdout).trim().to_owned();
    if uuid.is_empty() {
        anyhow::bail!("{root_partition:?} carries no UUID");
    }
    Ok(uuid)
}

/// A configured CPU vendor whose microcode image is missing is a warning, not
/// an abort; the image boots without early microcode.
async fn resolve_microcode(vendor: Option<CpuVendor>) -> Option<PathBuf> {
    let vendor = vendor?;
    let path = PathBuf::from(ESP_ROOT).join(vendor.microcode_image());
    match tokio::fs::try_exists(&path).await {
        Ok(true) => Some(path),
        _ => {
            tracing::warn!(
                ?path,
                "microcode image for {vendor} is missing; building without early microcode"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cmdline_unlocks_and_mounts_the_mapped_root() {
        let cmdline = kernel_cmdline("1234-abcd");
        assert!(cmdline.contains("cryptdevice=UUID=1234-abcd:cryptroot"));
        assert!(cmdline.contains("root=/dev/mapper/cryptroot"));
        assert!(cmdline.contains("rootflags=subvol=@"));
        assert!(cmdline.ends_with("rw"));
    }

    #[tokio::test]
    async fn absent_vendor_means_no_microcode() {
        assert_eq!(resolve_microcode(None).await, None);
    }
}
