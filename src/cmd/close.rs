//! Manual unwind for an interrupted provisioning run: unmount whatever is
//! still mounted under the staging root, then deactivate the mapping.

use anyhow::Result;
use async_trait::async_trait;

use crate::{cli::CloseOptions, crypt, fs};

pub struct CloseCommand {
    pub close_options: CloseOptions,
}

#[async_trait]
impl super::Command for CloseCommand {
    async fn run(&self) -> Result<()> {
        let options = &self.close_options;

        fs::mount::umount_recursive(&options.mount_root).await?;

        if crypt::is_mapping_active(&options.mapping) {
            crypt::close_mapping(&options.mapping).await?;
            tracing::info!(mapping = options.mapping, "mapping closed");
        } else {
            tracing::info!(mapping = options.mapping, "mapping is not active, nothing to close");
        }

        Ok(())
    }
}
