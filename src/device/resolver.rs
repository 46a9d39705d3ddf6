use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context as _, Result};
use serde::Deserialize;
use tokio::process::Command;

use crate::fs::cmd::CheckCommandOutput as _;

/// How partition device nodes are named for a given disk.
///
/// Disks whose name ends in a digit (nvme0n1, mmcblk0, loop0, ...) get a `p`
/// separator before the partition index; classic sdX/vdX names do not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamingScheme {
    Suffix,
    PSuffix,
}

impl NamingScheme {
    pub fn for_disk(disk: &Path) -> NamingScheme {
        let name = disk
            .file_name()
            .map(|n| n.to_string_lossy())
            .unwrap_or_default();
        if name.chars().last().is_some_and(|c| c.is_ascii_digit()) {
            NamingScheme::PSuffix
        } else {
            NamingScheme::Suffix
        }
    }
}

/// Derive the device path of partition `index` (1-based) on `disk`.
///
/// Pure and deterministic; never consults the filesystem.
pub fn partition_path(disk: &Path, index: u32) -> PathBuf {
    let disk_str = disk.to_string_lossy();
    match NamingScheme::for_disk(disk) {
        NamingScheme::Suffix => PathBuf::from(format!("{disk_str}{index}")),
        NamingScheme::PSuffix => PathBuf::from(format!("{disk_str}p{index}")),
    }
}

#[derive(Deserialize)]
struct LsblkOutput {
    blockdevices: Vec<LsblkDevice>,
}

#[derive(Deserialize)]
struct LsblkDevice {
    name: String,
    #[serde(rename = "type")]
    devtype: String,
    size: u64,
}

/// A resolved provisioning target. Construction proves the path is a whole
/// block device, so later destructive stages never run against a file or a
/// partition by mistake.
#[derive(Debug, Clone)]
pub struct TargetDisk {
    path: PathBuf,
    size_bytes: u64,
}

impl TargetDisk {
    pub async fn resolve(path: &Path) -> Result<Self> {
        let stdout = Command::new("lsblk")
            .args(["--json", "--bytes", "--nodeps", "-o", "NAME,TYPE,SIZE"])
            .arg(path)
            .run()
            .await
            .with_context(|| format!("{path:?} does not look like an attached block device"))?;

        let parsed: LsblkOutput =
            serde_json::from_slice(&stdout).context("Failed to parse lsblk output")?;
        let dev = parsed
            .blockdevices
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("No lsblk output for {path:?}"))?;

        if dev.devtype != "disk" && dev.devtype != "loop" {
            bail!(
                "{path:?} is a {} device, not a whole disk; refusing to partition it",
                dev.devtype
            );
        }

        tracing::debug!(name = dev.name, size = dev.size, "resolved target disk");

        Ok(Self {
            path: path.to_path_buf(),
            size_bytes: dev.size,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn esp_partition(&self) -> PathBuf {
        partition_path(&self.path, 1)
    }

    pub fn root_partition(&self) -> PathBuf {
        partition_path(&self.path, 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("/dev/sda", 1, "/dev/sda1")]
    #[case("/dev/sdb", 2, "/dev/sdb2")]
    #[case("/dev/vda", 2, "/dev/vda2")]
    #[case("/dev/nvme0n1", 1, "/dev/nvme0n1p1")]
    #[case("/dev/nvme1n1", 2, "/dev/nvme1n1p2")]
    #[case("/dev/mmcblk0", 1, "/dev/mmcblk0p1")]
    #[case("/dev/loop0", 2, "/dev/loop0p2")]
    fn partition_path_is_derived_per_naming_scheme(
        #[case] disk: &str,
        #[case] index: u32,
        #[case] expected: &str,
    ) {
        assert_eq!(partition_path(Path::new(disk), index), Path::new(expected));
    }

    #[test]
    fn derivation_is_deterministic() {
        let a = partition_path(Path::new("/dev/nvme0n1"), 2);
        let b = partition_path(Path::new("/dev/nvme0n1"), 2);
        assert_eq!(a, b);
    }
}
