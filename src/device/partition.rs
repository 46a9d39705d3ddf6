use anyhow::{bail, Context as _, Result};
use tokio::process::Command;

use crate::{crypt, fs::cmd::CheckCommandOutput as _};

use super::resolver::TargetDisk;

/// GPT type codes as understood by sgdisk.
const TYPE_ESP: &str = "ef00";
const TYPE_LUKS: &str = "8309";

const MIN_ESP_MIB: u64 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionRole {
    Esp,
    Root,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionSize {
    Mib(u64),
    Remainder,
}

#[derive(Debug, Clone)]
pub struct PartitionSpec {
    pub role: PartitionRole,
    pub size: PartitionSize,
    pub type_code: &'static str,
}

/// An ordered partition plan: the ESP first, then the encrypted root taking
/// the remainder of the disk.
#[derive(Debug, Clone)]
pub struct PartitionPlan {
    partitions: Vec<PartitionSpec>,
}

impl PartitionPlan {
    pub fn standard(esp_mib: u64) -> Self {
        Self {
            partitions: vec![
                PartitionSpec {
                    role: PartitionRole::Esp,
                    size: PartitionSize::Mib(esp_mib),
                    type_code: TYPE_ESP,
                },
                PartitionSpec {
                    role: PartitionRole::Root,
                    size: PartitionSize::Remainder,
                    type_code: TYPE_LUKS,
                },
            ],
        }
    }

    pub fn partitions(&self) -> &[PartitionSpec] {
        &self.partitions
    }

    pub fn validate(&self, disk_size_bytes: u64) -> Result<()> {
        match self.partitions.first() {
            Some(spec) if spec.role == PartitionRole::Esp => (),
            _ => bail!("The partition plan must start with the EFI system partition"),
        }

        let roots = self
            .partitions
            .iter()
            .filter(|p| p.role == PartitionRole::Root)
            .count();
        if roots != 1 {
            bail!("The partition plan must contain exactly one root partition, found {roots}");
        }

        let mut fixed_mib: u64 = 0;
        for spec in &self.partitions {
            if let (PartitionRole::Esp, PartitionSize::Mib(mib)) = (spec.role, spec.size) {
                if mib < MIN_ESP_MIB {
                    bail!("ESP size {mib} MiB is below the {MIN_ESP_MIB} MiB minimum");
                }
            }
            if let PartitionSize::Mib(mib) = spec.size {
                fixed_mib = fixed_mib
                    .checked_add(mib)
                    .with_context(|| format!("Partition sizes overflow at {mib} MiB"))?;
            }
        }

        // Leave slack for the GPT headers themselves. Sizes come from config,
        // so the arithmetic must not wrap.
        let needed_bytes = fixed_mib
            .checked_add(16)
            .and_then(|mib| mib.checked_mul(1024 * 1024))
            .with_context(|| format!("Plan size of {fixed_mib} MiB overflows"))?;
        if needed_bytes > disk_size_bytes {
            bail!(
                "Disk is too small: plan needs at least {} MiB, disk has {} MiB",
                fixed_mib + 16,
                disk_size_bytes / 1024 / 1024
            );
        }

        Ok(())
    }

    /// The sgdisk invocation for this plan. Pure, so the exact destructive
    /// command is unit-testable without a disk.
    pub fn sgdisk_args(&self) -> Vec<String> {
        let mut args = vec!["--zap-all".to_owned()];
        for (i, spec) in self.partitions.iter().enumerate() {
            let index = i + 1;
            match spec.size {
                PartitionSize::Mib(mib) => args.push(format!("--new={index}:0:+{mib}MiB")),
                PartitionSize::Remainder => args.push(format!("--new={index}:0:0")),
            }
            args.push(format!("--typecode={index}:{}", spec.type_code));
        }
        args
    }

    /// Write a fresh partition table to the disk. Destroys whatever was there;
    /// the caller is responsible for having confirmed this.
    pub async fn apply(&self, disk: &TargetDisk) -> Result<()> {
        self.validate(disk.size_bytes())?;

        if crypt::is_dev_in_use(disk.path()).await? {
            bail!(
                "Disk {:?} is busy (mounted or mapped); refusing to rewrite its partition table",
                disk.path()
            );
        }

        tracing::info!(disk = ?disk.path(), "writing new partition table");

        Command::new("sgdisk")
            .args(self.sgdisk_args())
            .arg(disk.path())
            .run()
            .await
            .with_context(|| format!("Failed to partition {:?}", disk.path()))?;

        // The kernel must re-read the table before the new nodes exist.
        Command::new("partprobe")
            .arg(disk.path())
            .run()
            .await
            .with_context(|| format!("Failed to re-read partition table of {:?}", disk.path()))?;

        Command::new("udevadm")
            .args(["settle"])
            .run()
            .await
            .context("udev did not settle after partitioning")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_plan_is_esp_then_root() {
        let plan = PartitionPlan::standard(1025);
        let roles: Vec<_> = plan.partitions().iter().map(|p| p.role).collect();
        assert_eq!(roles, vec![PartitionRole::Esp, PartitionRole::Root]);
        plan.validate(64 * 1024 * 1024 * 1024).unwrap();
    }

    #[test]
    fn sgdisk_args_are_deterministic() {
        let plan = PartitionPlan::standard(1025);
        let args = plan.sgdisk_args();
        assert_eq!(
            args,
            vec![
                "--zap-all",
                "--new=1:0:+1025MiB",
                "--typecode=1:ef00",
                "--new=2:0:0",
                "--typecode=2:8309",
            ]
        );
    }

    #[test]
    fn undersized_esp_is_rejected() {
        let plan = PartitionPlan::standard(64);
        assert!(plan.validate(64 * 1024 * 1024 * 1024).is_err());
    }

    #[test]
    fn undersized_disk_is_rejected() {
        let plan = PartitionPlan::standard(1024);
        assert!(plan.validate(512 * 1024 * 1024).is_err());
    }

    #[test]
    fn absurd_esp_size_fails_instead_of_wrapping() {
        let plan = PartitionPlan::standard(u64::MAX);
        assert!(plan.validate(64 * 1024 * 1024 * 1024).is_err());

        let plan = PartitionPlan::standard(u64::MAX / 1024 / 1024);
        assert!(plan.validate(u64::MAX).is_err());
    }
}
