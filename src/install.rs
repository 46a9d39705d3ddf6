use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context as _, Result};
use tokio::process::Command;

use crate::{
    fs::cmd::CheckCommandOutput as _,
    types::{CpuVendor, GpuFamily},
};

/// Always installed, regardless of hardware.
pub const BASE_PACKAGES: &[&str] = &[
    "base",
    "base-devel",
    "linux",
    "linux-firmware",
    "btrfs-progs",
    "cryptsetup",
    "mkinitcpio",
    "networkmanager",
    "sudo",
    "vim",
    "mesa",
    "efibootmgr",
    "sbctl",
];

/// Package installation depends on network mirrors; don't hang forever.
const INSTALL_TIMEOUT: Duration = Duration::from_secs(45 * 60);

/// The package set for one provisioning run: the static base plus the
/// conditional members selected by CPU vendor and GPU family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageSet {
    packages: Vec<&'static str>,
}

impl PackageSet {
    pub fn assemble(cpu_vendor: Option<CpuVendor>, gpu: GpuFamily) -> Self {
        let mut packages = BASE_PACKAGES.to_vec();

        if let Some(vendor) = cpu_vendor {
            packages.push(vendor.microcode_package());
        }

        packages.extend(gpu_packages(gpu));

        Self { packages }
    }

    pub fn packages(&self) -> &[&'static str] {
        &self.packages
    }
}

/// Per-family driver subsets. Kept disjoint so selecting one family can never
/// drag in another family's stack.
fn gpu_packages(gpu: GpuFamily) -> &'static [&'static str] {
    match gpu {
        GpuFamily::NvidiaProprietary => &["nvidia", "nvidia-settings"],
        GpuFamily::NvidiaOpen => &["nvidia-open"],
        GpuFamily::Amd => &["vulkan-radeon", "libva-mesa-driver", "xf86-video-amdgpu"],
        GpuFamily::Intel => &["vulkan-intel", "intel-media-driver"],
        GpuFamily::None => &[],
    }
}

/// Populate the mounted tree with the package set. The tool itself is
/// all-or-nothing at this level; a failure here is surfaced, not recovered.
pub async fn install_base_system(mount_root: &Path, set: &PackageSet) -> Result<()> {
    tracing::info!(
        packages = set.packages().len(),
        "installing base system (this downloads packages and can take a while)"
    );

    tokio::time::timeout(
        INSTALL_TIMEOUT,
        Command::new("pacstrap")
            .arg("-K")
            .arg(mount_root)
            .args(set.packages())
            .run(),
    )
    .await
    .map_err(|_| anyhow!("Base system installation timed out"))?
    .context("Failed to install the base system")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn amd_selection_excludes_other_families() {
        let set = PackageSet::assemble(Some(CpuVendor::Amd), GpuFamily::Amd);
        let packages = set.packages();

        assert!(packages.contains(&"vulkan-radeon"));
        assert!(packages.contains(&"amd-ucode"));

        for family in [
            GpuFamily::NvidiaProprietary,
            GpuFamily::NvidiaOpen,
            GpuFamily::Intel,
        ] {
            for pkg in gpu_packages(family) {
                assert!(!packages.contains(pkg), "{pkg} leaked into the AMD set");
            }
        }
        assert!(!packages.contains(&"intel-ucode"));
    }

    #[test]
    fn at_most_one_microcode_package() {
        let set = PackageSet::assemble(None, GpuFamily::None);
        assert!(!set.packages().contains(&"amd-ucode"));
        assert!(!set.packages().contains(&"intel-ucode"));

        let set = PackageSet::assemble(Some(CpuVendor::Intel), GpuFamily::None);
        let microcode: Vec<_> = set
            .packages()
            .iter()
            .filter(|p| p.ends_with("-ucode"))
            .collect();
        assert_eq!(microcode, vec![&"intel-ucode"]);
    }

    #[rstest]
    #[case(GpuFamily::NvidiaProprietary)]
    #[case(GpuFamily::NvidiaOpen)]
    #[case(GpuFamily::Amd)]
    #[case(GpuFamily::Intel)]
    fn gpu_subsets_are_disjoint(#[case] family: GpuFamily) {
        for other in [
            GpuFamily::NvidiaProprietary,
            GpuFamily::NvidiaOpen,
            GpuFamily::Amd,
            GpuFamily::Intel,
        ] {
            if other == family {
                continue;
            }
            for pkg in gpu_packages(family) {
                assert!(
                    !gpu_packages(other).contains(pkg),
                    "{pkg} appears in both {family} and {other}"
                );
            }
        }
    }
}
