pub mod boot;
pub mod capability;
pub mod cli;
pub mod cmd;
pub mod config;
pub mod crypt;
pub mod device;
pub mod fs;
pub mod install;
pub mod stage;
pub mod system;
pub mod types;

use anyhow::{bail, Result};
use clap::Parser as _;
use cmd::IntoCommand as _;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _};

pub async fn run() -> Result<()> {
    let filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = cli::Args::parse();

    if args.command.is_privileged() && !nix::unistd::Uid::effective().is_root() {
        bail!("This command modifies block devices and must be run as root");
    }

    args.command.into_command().run().await?;

    Ok(())
}

/// A macro like scopeguard::defer! but can defer a future.
///
/// Note that other code running concurrently in the same task will be suspended
/// due to the call to block_in_place, until the future is finished.
///
/// # Panics
///
/// This macro should only be used in tokio multi-thread runtime, and will panics
/// if called from a [`current_thread`] runtime.
#[macro_export]
macro_rules! async_defer {
    ($future:expr) => {
        scopeguard::defer! {
            tokio::task::block_in_place(|| {
                tokio::runtime::Handle::current().block_on(async {
                    let _ = $future.await;
                });
            });
        }
    };
}
