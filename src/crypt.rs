//! LUKS2 container lifecycle for the root partition.
//!
//! The open/closed states are separate types, so a filesystem can only be
//! mounted through an [`OpenContainer`] and a mapping can only be closed once.

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};
use tokio::{fs::OpenOptions, process::Command};

use crate::{fs::cmd::CheckCommandOutput as _, types::Passphrase};

/// cryptsetup exit codes we give dedicated errors to.
const EXIT_BAD_PASSPHRASE: i32 = 2;
const EXIT_EXISTS_OR_BUSY: i32 = 5;

#[derive(Debug, thiserror::Error)]
pub enum CryptError {
    #[error("passphrase was not accepted for {dev:?}")]
    Authentication { dev: PathBuf },

    #[error("mapping name `{mapping}` is already in use")]
    AlreadyOpen { mapping: String },

    #[error("mapping `{mapping}` is still held open (active mounts?)")]
    Busy { mapping: String },
}

/// Cipher/KDF profile a container is formatted with. Immutable once the
/// header is written; opening later only needs the passphrase.
///
/// The KDF time cost is deliberately large (multi-second) to resist offline
/// brute force, and stays a knob rather than a constant.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct EncryptionProfile {
    pub cipher: String,
    pub key_size: u32,
    pub hash: String,
    pub kdf: String,
    pub kdf_time_ms: u32,
    pub luks_version: u8,
}

impl Default for EncryptionProfile {
    fn default() -> Self {
        Self {
            cipher: "aes-xts-plain64".to_owned(),
            key_size: 512,
            hash: "sha512".to_owned(),
            kdf: "argon2id".to_owned(),
            kdf_time_ms: 5000,
            luks_version: 2,
        }
    }
}

impl EncryptionProfile {
    pub fn validate(&self) -> Result<()> {
        if self.luks_version != 2 {
            anyhow::bail!("Only LUKS version 2 containers are supported");
        }
        if self.key_size == 0 || self.key_size % 8 != 0 {
            anyhow::bail!("Key size must be a positive multiple of 8 bits");
        }
        Ok(())
    }

    fn format_args(&self) -> Vec<String> {
        vec![
            "--batch-mode".to_owned(),
            "--type".to_owned(),
            format!("luks{}", self.luks_version),
            "--cipher".to_owned(),
            self.cipher.clone(),
            "--key-size".to_owned(),
            self.key_size.to_string(),
            "--hash".to_owned(),
            self.hash.clone(),
            "--pbkdf".to_owned(),
            self.kdf.clone(),
            "--iter-time".to_owned(),
            self.kdf_time_ms.to_string(),
        ]
    }
}

/// A formatted container with no active mapping.
#[derive(Debug)]
pub struct ClosedContainer {
    dev: PathBuf,
}

/// A container with an active decrypted mapping under /dev/mapper.
#[derive(Debug)]
pub struct OpenContainer {
    dev: PathBuf,
    mapping: String,
}

/// Format `dev` as a fresh LUKS container. Irreversible: the old partition
/// contents are gone once the header is written.
pub async fn format(
    dev: &Path,
    profile: &EncryptionProfile,
    passphrase: &Passphrase,
) -> Result<ClosedContainer> {
    profile.validate()?;

    tracing::info!(
        ?dev,
        kdf = profile.kdf,
        kdf_time_ms = profile.kdf_time_ms,
        "formatting LUKS container; the key derivation is tuned to take \
         several seconds, this is expected"
    );

    Command::new("cryptsetup")
        .arg("luksFormat")
        .args(profile.format_args())
        .arg(dev)
        .arg("-")
        .run_with_input(passphrase.as_bytes())
        .await
        .with_context(|| format!("Failed to format {dev:?} as a LUKS{} container", profile.luks_version))?;

    Ok(ClosedContainer {
        dev: dev.to_path_buf(),
    })
}

impl ClosedContainer {
    pub fn dev(&self) -> &Path {
        &self.dev
    }

    /// Authenticate and activate the mapping. Wrong passphrase and name
    /// collisions surface as typed [`CryptError`]s.
    pub async fn open(self, passphrase: &Passphrase, mapping: &str) -> Result<OpenContainer> {
        let dev = self.dev;

        Command::new("cryptsetup")
            .arg("open")
            .arg(&dev)
            .arg(mapping)
            .arg("--key-file=-")
            .run_with_input_and_status_checker(Some(passphrase.as_bytes()), |code, _, _| {
                match code {
                    0 => Ok(()),
                    EXIT_BAD_PASSPHRASE => {
                        Err(CryptError::Authentication { dev: dev.clone() }.into())
                    }
                    EXIT_EXISTS_OR_BUSY => Err(CryptError::AlreadyOpen {
                        mapping: mapping.to_owned(),
                    }
                    .into()),
                    _ => anyhow::bail!("Bad exit code"),
                }
            })
            .await
            .with_context(|| format!("Failed to open container on {dev:?}"))?;

        Ok(OpenContainer {
            dev,
            mapping: mapping.to_owned(),
        })
    }
}

impl OpenContainer {
    pub fn dev(&self) -> &Path {
        &self.dev
    }

    pub fn mapping(&self) -> &str {
        &self.mapping
    }

    pub fn mapper_path(&self) -> PathBuf {
        PathBuf::from(format!("/dev/mapper/{}", self.mapping))
    }

    /// Deactivate the mapping. Anything still mounted on it makes this fail
    /// with [`CryptError::Busy`].
    pub async fn close(self) -> Result<ClosedContainer> {
        close_mapping(&self.mapping).await?;
        Ok(ClosedContainer { dev: self.dev })
    }
}

pub fn is_mapping_active(mapping: &str) -> bool {
    PathBuf::from(format!("/dev/mapper/{mapping}")).exists()
}

/// Close a mapping by name, without a container value. Used for the manual
/// unwind path and for clearing a leftover mapping before re-opening.
pub async fn close_mapping(mapping: &str) -> Result<()> {
    Command::new("cryptsetup")
        .arg("close")
        .arg(mapping)
        .run_with_status_checker(|code, _, _| match code {
            0 => Ok(()),
            EXIT_EXISTS_OR_BUSY => Err(CryptError::Busy {
                mapping: mapping.to_owned(),
            }
            .into()),
            _ => anyhow::bail!("Bad exit code"),
        })
        .await
        .with_context(|| format!("Failed to close mapping `{mapping}`"))
}

/// O_EXCL open probe: the kernel refuses it while the device is mounted or
/// claimed by device-mapper.
pub async fn is_dev_in_use(dev: &Path) -> Result<bool> {
    use std::os::unix::fs::OpenOptionsExt as _;

    let mut options = OpenOptions::new();
    options.read(true);
    options.custom_flags(libc::O_EXCL);
    match options.open(dev).await {
        Ok(_) => Ok(false),
        Err(e) if e.raw_os_error() == Some(libc::EBUSY) => Ok(true),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_profile_matches_policy() {
        let profile = EncryptionProfile::default();
        assert_eq!(profile.cipher, "aes-xts-plain64");
        assert_eq!(profile.key_size, 512);
        assert_eq!(profile.kdf, "argon2id");
        assert!(profile.kdf_time_ms >= 1000, "KDF must stay multi-second");
        profile.validate().unwrap();
    }

    #[test]
    fn format_args_carry_the_whole_profile() {
        let profile = EncryptionProfile::default();
        let args = profile.format_args();
        for expected in [
            "luks2",
            "aes-xts-plain64",
            "512",
            "sha512",
            "argon2id",
            "5000",
        ] {
            assert!(args.iter().any(|a| a == expected), "missing {expected}");
        }
    }

    #[test]
    fn luks1_profile_is_rejected() {
        let profile = EncryptionProfile {
            luks_version: 1,
            ..Default::default()
        };
        assert!(profile.validate().is_err());
    }
}
