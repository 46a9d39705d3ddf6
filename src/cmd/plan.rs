//! Dry-run view of a provisioning config: what would be written where, with
//! which packages, under the probed capabilities. Touches no disk.

use anyhow::Result;
use async_trait::async_trait;

use crate::{
    capability,
    cli::PlanOptions,
    config::ProvisionConfig,
    device::partition::{PartitionPlan, PartitionSize},
    fs::btrfs::SubvolumeTopology,
    install::PackageSet,
};

pub struct PlanCommand {
    pub plan_options: PlanOptions,
}

#[async_trait]
impl super::Command for PlanCommand {
    async fn run(&self) -> Result<()> {
        let config = ProvisionConfig::load(&self.plan_options.config).await?;
        let caps = capability::probe().await;

        println!("target disk: {}", config.disk.display());
        println!();

        println!("partitions:");
        let plan = PartitionPlan::standard(config.esp_mib);
        for (i, spec) in plan.partitions().iter().enumerate() {
            let size = match spec.size {
                PartitionSize::Mib(mib) => format!("{mib} MiB"),
                PartitionSize::Remainder => "remainder of disk".to_owned(),
            };
            println!("  {}: {:?} ({size}, type {})", i + 1, spec.role, spec.type_code);
        }
        println!();

        println!(
            "encryption: LUKS{} {} ({}-bit, {} at {} ms)",
            config.profile.luks_version,
            config.profile.cipher,
            config.profile.key_size,
            config.profile.kdf,
            config.profile.kdf_time_ms,
        );
        println!();

        println!("subvolumes:");
        for subvolume in SubvolumeTopology::standard().subvolumes() {
            println!("  {} -> /{}", subvolume.name, subvolume.target);
        }
        println!();

        let set = PackageSet::assemble(config.hardware.cpu_vendor, config.hardware.gpu);
        println!("packages ({}):", set.packages().len());
        for package in set.packages() {
            println!("  {package}");
        }
        println!();

        if config.swap_size_gib > 0 {
            println!("swap: {} GiB file", config.swap_size_gib);
        } else {
            println!("swap: none");
        }
        println!();

        println!("capabilities:");
        println!("  secure boot signing:   {}", yes_no(caps.secure_boot));
        println!("  firmware boot entries: {}", yes_no(caps.firmware_entries));
        println!("  native swap allocation: {}", yes_no(caps.btrfs_mkswapfile));

        Ok(())
    }
}

fn yes_no(flag: bool) -> &'static str {
    if flag {
        "yes"
    } else {
        "no"
    }
}
