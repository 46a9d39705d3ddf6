use std::path::{Path, PathBuf};

use anyhow::{bail, Context as _, Result};
use serde::{Deserialize, Serialize};

use crate::{
    crypt::EncryptionProfile,
    types::{CpuVendor, GpuFamily, Passphrase},
};

/// Parameter intake for a provisioning run. Collected once from the TOML
/// file, validated, then treated as frozen for the rest of the pipeline.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct ProvisionConfig {
    /// Target disk. Everything on it will be destroyed.
    pub disk: PathBuf,

    /// Size of the EFI system partition in MiB.
    #[serde(default = "default_esp_mib")]
    pub esp_mib: u64,

    /// LUKS2 profile for the root container.
    #[serde(default)]
    pub profile: EncryptionProfile,

    /// Passphrase for the root container.
    pub passphrase: String,

    /// Swap file size in GiB. Zero disables swap provisioning.
    #[serde(default)]
    pub swap_size_gib: u32,

    pub identity: Identity,

    pub credentials: Credentials,

    #[serde(default)]
    pub hardware: Hardware,

    /// Services enabled at the end of the second stage.
    #[serde(default = "default_services")]
    pub services: Vec<String>,

    /// Enroll the vendor (Microsoft) keys alongside our own, for dual-boot
    /// and option-ROM compatibility.
    #[serde(default = "default_true")]
    pub enroll_vendor_keys: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct Identity {
    pub hostname: String,
    pub username: String,
    pub timezone: String,
    pub locale: String,
    pub keymap: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct Credentials {
    pub root_password: String,
    pub user_password: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct Hardware {
    pub cpu_vendor: Option<CpuVendor>,
    #[serde(default)]
    pub gpu: GpuFamily,
}

fn default_esp_mib() -> u64 {
    1024
}

fn default_services() -> Vec<String> {
    vec!["NetworkManager".to_owned()]
}

fn default_true() -> bool {
    true
}

impl ProvisionConfig {
    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read provisioning config {path:?}"))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse provisioning config {path:?}"))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.identity.hostname.is_empty() || self.identity.username.is_empty() {
            bail!("hostname and username must not be empty");
        }
        if self.passphrase.is_empty() {
            bail!("The container passphrase must not be empty");
        }
        self.profile.validate()?;
        Ok(())
    }

    pub fn passphrase(&self) -> Passphrase {
        Passphrase::from(self.passphrase.clone())
    }
}

/// The frozen parameter record handed to the second stage. Serialized once by
/// the stage handoff and read back verbatim inside the new root; nothing in
/// here is re-derived there except the root partition UUID, which is only
/// computable inside.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StageParams {
    pub disk: PathBuf,
    pub root_partition: PathBuf,
    pub swap_size_gib: u32,
    pub identity: Identity,
    pub credentials: Credentials,
    pub hardware: Hardware,
    pub services: Vec<String>,
    pub enroll_vendor_keys: bool,
}

impl StageParams {
    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read stage-2 parameters {path:?}"))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse stage-2 parameters {path:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
disk = "/dev/sdb"
passphrase = "correct horse"
swap_size_gib = 8

[identity]
hostname = "anvil"
username = "smith"
timezone = "Europe/Berlin"
locale = "en_US.UTF-8"
keymap = "us"

[credentials]
root_password = "r"
user_password = "u"

[hardware]
cpu_vendor = "amd"
gpu = "amd"
"#;

    #[test]
    fn sample_config_parses_with_defaults() {
        let config: ProvisionConfig = toml::from_str(SAMPLE).unwrap();
        assert_eq!(config.esp_mib, 1024);
        assert_eq!(config.hardware.cpu_vendor, Some(CpuVendor::Amd));
        assert_eq!(config.services, vec!["NetworkManager".to_owned()]);
        assert!(config.enroll_vendor_keys);
        config.validate().unwrap();
    }

    #[test]
    fn empty_passphrase_is_rejected() {
        let mut config: ProvisionConfig = toml::from_str(SAMPLE).unwrap();
        config.passphrase.clear();
        assert!(config.validate().is_err());
    }
}
