//! The outer provisioning pipeline.
//!
//! Strictly sequential; every stage depends on the device and filesystem
//! state left by the previous one. Policy on fatal errors is to stop without
//! unwinding the steps that already ran: a half-provisioned disk is left for
//! inspection, and `vaultstrap close` is the deliberate manual unwind. The
//! error contexts below state what is left open or mounted at each stage.

use anyhow::{bail, Context as _, Result};
use async_trait::async_trait;

use crate::{
    capability,
    cli::ProvisionOptions,
    config::{ProvisionConfig, StageParams},
    crypt,
    device::{partition::PartitionPlan, resolver::TargetDisk},
    fs::{self, btrfs::SubvolumeTopology},
    install::{self, PackageSet},
    stage,
};

/// Name of the decrypted root mapping, shared with the kernel command line.
pub const ROOT_MAPPING: &str = "cryptroot";

pub struct ProvisionCommand {
    pub provision_options: ProvisionOptions,
}

#[async_trait]
impl super::Command for ProvisionCommand {
    async fn run(&self) -> Result<()> {
        let options = &self.provision_options;
        let config = ProvisionConfig::load(&options.config).await?;
        let caps = capability::probe().await;

        let disk = TargetDisk::resolve(&config.disk).await?;

        if !options.yes {
            bail!(
                "Provisioning destroys everything on {:?}. Re-run with --yes to confirm.",
                disk.path()
            );
        }

        let plan = PartitionPlan::standard(config.esp_mib);
        plan.apply(&disk)
            .await
            .context("ABORTED while partitioning; the old partition table is already gone")?;

        let esp_partition = disk.esp_partition();
        let root_partition = disk.root_partition();

        // A mapping left over from an earlier attempt is a precondition to
        // clear, not an error.
        if crypt::is_mapping_active(ROOT_MAPPING) {
            tracing::warn!("mapping `{ROOT_MAPPING}` already active, closing it first");
            crypt::close_mapping(ROOT_MAPPING).await?;
        }

        let passphrase = config.passphrase();
        let container = crypt::format(&root_partition, &config.profile, &passphrase)
            .await
            .context("ABORTED while formatting the container; the disk is partitioned but the root partition holds no usable container")?;

        let container = container
            .open(&passphrase, ROOT_MAPPING)
            .await
            .context("ABORTED opening the container; it is formatted and closed")?;

        fs::mkfs::format_esp(&esp_partition)
            .await
            .context("ABORTED formatting the ESP; the container is still open")?;
        fs::mkfs::format_root(&container.mapper_path())
            .await
            .context("ABORTED formatting the root filesystem; the container is still open")?;

        let topology = SubvolumeTopology::standard();
        fs::btrfs::create_subvolumes(&container.mapper_path(), &topology)
            .await
            .context("ABORTED creating subvolumes; the container is still open")?;

        let mount_stack = fs::btrfs::mount_topology(
            &container.mapper_path(),
            &topology,
            &esp_partition,
            &options.mount_root,
        )
        .await
        .context("ABORTED mounting the topology; the container is still open and some subvolumes may be mounted")?;

        let mounted_context = || {
            format!(
                "the topology is mounted at {:?} and the container is open; \
                 run `vaultstrap close` to unwind",
                options.mount_root
            )
        };

        let package_set = PackageSet::assemble(config.hardware.cpu_vendor, config.hardware.gpu);
        install::install_base_system(&options.mount_root, &package_set)
            .await
            .with_context(mounted_context)?;

        fs::fstab::generate(&options.mount_root)
            .await
            .with_context(mounted_context)?;

        let params = StageParams {
            disk: config.disk.clone(),
            root_partition: root_partition.clone(),
            swap_size_gib: config.swap_size_gib,
            identity: config.identity.clone(),
            credentials: config.credentials.clone(),
            hardware: config.hardware.clone(),
            services: config.services.clone(),
            enroll_vendor_keys: config.enroll_vendor_keys && caps.secure_boot,
        };

        stage::handoff::hand_off(&options.mount_root, &params)
            .await
            .with_context(mounted_context)?;

        // Teardown happens in strictly reverse mount order; the container
        // must be closed before the host can safely go away.
        mount_stack
            .unmount_all()
            .await
            .context("Second stage finished but unmounting failed; run `vaultstrap close`")?;
        container
            .close()
            .await
            .context("Unmounted, but the container did not close cleanly")?;

        tracing::info!(
            "provisioning of {:?} complete; the disk is unmounted, the \
             container is closed, and the system is ready to boot",
            disk.path()
        );

        Ok(())
    }
}
