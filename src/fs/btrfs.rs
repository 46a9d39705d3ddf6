use std::path::Path;

use anyhow::{Context as _, Result};
use tokio::process::Command;

use super::{
    cmd::CheckCommandOutput as _,
    mount::{MountStack, TmpMount},
};

/// Mount options shared by every subvolume mount.
const BASE_OPTIONS: &str = "compress=zstd,noatime,space_cache=v2";

/// Where the ESP lands inside the mounted tree.
pub const ESP_MOUNT_POINT: &str = "boot";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subvolume {
    /// Subvolume name inside the btrfs top level.
    pub name: &'static str,
    /// Mount point relative to the mount root; empty string is the root.
    pub target: &'static str,
}

/// The fixed subvolume layout of the root filesystem.
///
/// `@` must come first: it is mounted before any sibling, and the siblings
/// are non-nested so their relative mount order does not matter.
#[derive(Debug, Clone)]
pub struct SubvolumeTopology {
    subvolumes: Vec<Subvolume>,
}

impl SubvolumeTopology {
    pub fn standard() -> Self {
        Self {
            subvolumes: vec![
                Subvolume { name: "@", target: "" },
                Subvolume { name: "@home", target: "home" },
                Subvolume { name: "@var", target: "var" },
                Subvolume { name: "@tmp", target: "tmp" },
                Subvolume { name: "@snapshots", target: ".snapshots" },
            ],
        }
    }

    pub fn subvolumes(&self) -> &[Subvolume] {
        &self.subvolumes
    }

    /// The full option string for one subvolume mount. Pure, so option
    /// application is reproducible across remounts.
    pub fn mount_options(&self, subvol: &Subvolume) -> String {
        format!("{BASE_OPTIONS},subvol={}", subvol.name)
    }
}

/// Create the subvolume set on a freshly formatted filesystem.
///
/// This happens exactly once per filesystem: `btrfs subvolume create` fails
/// on an existing path, and that failure is surfaced loudly rather than
/// skipped, since it means the target was already populated.
pub async fn create_subvolumes(mapped_dev: &Path, topology: &SubvolumeTopology) -> Result<()> {
    let top = TmpMount::mount(mapped_dev).await?;

    let result = async {
        for subvol in topology.subvolumes() {
            let path = top.path().join(subvol.name);
            Command::new("btrfs")
                .args(["subvolume", "create"])
                .arg(&path)
                .run()
                .await
                .with_context(|| {
                    format!(
                        "Failed to create subvolume {}; an existing subvolume means \
                         this filesystem was already provisioned",
                        subvol.name
                    )
                })?;
        }
        Ok(())
    }
    .await;

    top.unmount().await?;
    result
}

/// Mount the whole topology under `mount_root`: root subvolume first, then
/// the siblings, then the ESP last at its designated mount point.
pub async fn mount_topology(
    mapped_dev: &Path,
    topology: &SubvolumeTopology,
    esp_dev: &Path,
    mount_root: &Path,
) -> Result<MountStack> {
    let mut stack = MountStack::new();

    for subvol in topology.subvolumes() {
        let target = mount_root.join(subvol.target);
        tokio::fs::create_dir_all(&target)
            .await
            .with_context(|| format!("Failed to create mount point {target:?}"))?;
        stack
            .push(mapped_dev, &target, Some(&topology.mount_options(subvol)))
            .await?;
    }

    let esp_target = mount_root.join(ESP_MOUNT_POINT);
    tokio::fs::create_dir_all(&esp_target)
        .await
        .with_context(|| format!("Failed to create mount point {esp_target:?}"))?;
    stack.push(esp_dev, &esp_target, None).await?;

    Ok(stack)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_subvolume_is_mounted_first() {
        let topology = SubvolumeTopology::standard();
        assert_eq!(topology.subvolumes()[0].name, "@");
        assert_eq!(topology.subvolumes()[0].target, "");
    }

    #[test]
    fn topology_covers_the_fixed_set() {
        let topology = SubvolumeTopology::standard();
        let names: Vec<_> = topology.subvolumes().iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["@", "@home", "@var", "@tmp", "@snapshots"]);
    }

    #[test]
    fn mount_options_are_idempotent_across_calls() {
        let topology = SubvolumeTopology::standard();
        for subvol in topology.subvolumes() {
            let first = topology.mount_options(subvol);
            let second = topology.mount_options(subvol);
            assert_eq!(first, second);
            assert!(first.contains("compress=zstd"));
            assert!(first.contains("noatime"));
            assert!(first.contains("space_cache=v2"));
            assert!(first.ends_with(&format!("subvol={}", subvol.name)));
        }
    }
}
