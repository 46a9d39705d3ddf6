use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Parser, Debug)]
pub enum Command {
    /// Provision a target disk: partition, encrypt, build filesystems, install
    /// the base system and hand off to the in-root configuration stage.
    #[command(name = "provision")]
    Provision(ProvisionOptions),

    /// Second stage, executed inside the new root. Not meant to be invoked by
    /// hand; the provisioning stage generates a runner script for it.
    #[command(name = "configure")]
    Configure(ConfigureOptions),

    /// Tear down a (possibly partial) provisioning run: unmount the topology
    /// in reverse order and close the encryption mapping.
    #[command(name = "close")]
    Close(CloseOptions),

    /// Print the resolved partition plan, package set and capability probe
    /// without touching the disk.
    #[command(name = "plan")]
    Plan(PlanOptions),
}

impl Command {
    pub fn is_privileged(&self) -> bool {
        !matches!(self, Command::Plan(_))
    }
}

#[derive(Parser, Debug)]
pub struct ProvisionOptions {
    /// Path to the provisioning parameter file (TOML).
    #[clap(long, short = 'c')]
    pub config: PathBuf,

    /// Skip the destructive-action confirmation.
    #[clap(long, short = 'y', default_value = "false")]
    pub yes: bool,

    /// Where to mount the new root during provisioning.
    #[clap(long, default_value = "/mnt")]
    pub mount_root: PathBuf,
}

#[derive(Parser, Debug)]
pub struct ConfigureOptions {
    /// Path to the frozen stage-2 parameter record.
    #[clap(long, default_value = "/etc/vaultstrap/stage2.toml")]
    pub params: PathBuf,
}

#[derive(Parser, Debug)]
pub struct CloseOptions {
    /// Name of the encryption mapping to close.
    #[clap(long, default_value = "cryptroot")]
    pub mapping: String,

    /// Mount root to unmount recursively before closing the mapping.
    #[clap(long, default_value = "/mnt")]
    pub mount_root: PathBuf,
}

#[derive(Parser, Debug)]
pub struct PlanOptions {
    /// Path to the provisioning parameter file (TOML).
    #[clap(long, short = 'c')]
    pub config: PathBuf,
}
