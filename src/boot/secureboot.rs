//! Secure Boot key lifecycle and boot-chain signing.
//!
//! A [`SecureBootKeys`] value only exists once key creation succeeded, so
//! signing before creation cannot be expressed. Enrollment failure is not
//! fatal: created-but-unenrolled keys still produce valid signatures, the
//! firmware just has to be enrolled later.

use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context as _, Result};
use tokio::process::Command;

use crate::fs::cmd::CheckCommandOutput as _;

/// Firmware interaction can wedge; don't let enrollment hang the pipeline.
const ENROLL_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug)]
pub struct SecureBootKeys {
    enrolled: bool,
}

/// A boot-chain binary to sign, and whether an unsigned copy breaks the
/// primary boot path.
#[derive(Debug, Clone)]
pub struct SigningTarget {
    pub path: std::path::PathBuf,
    pub critical: bool,
}

impl SecureBootKeys {
    /// Generate the local key hierarchy. On failure the caller is expected to
    /// degrade to an explicit unsigned mode, not abort.
    pub async fn create() -> Result<Self> {
        Command::new("sbctl")
            .arg("create-keys")
            .run()
            .await
            .context("Failed to create the Secure Boot key hierarchy")?;

        Ok(Self { enrolled: false })
    }

    /// Install the keys into the firmware trust store, optionally merging the
    /// vendor keys for dual-boot compatibility.
    pub async fn enroll(&mut self, with_vendor_keys: bool) -> Result<()> {
        let mut cmd = Command::new("sbctl");
        cmd.arg("enroll-keys");
        if with_vendor_keys {
            cmd.arg("--microsoft");
        }

        tokio::time::timeout(ENROLL_TIMEOUT, cmd.run())
            .await
            .map_err(|_| anyhow!("Key enrollment timed out"))?
            .context("Failed to enroll keys into the firmware trust store")?;

        self.enrolled = true;
        Ok(())
    }

    pub fn is_enrolled(&self) -> bool {
        self.enrolled
    }

    /// Sign one binary in place. Must run after the final byte of the target
    /// is written; rebuilding a signed binary invalidates its signature.
    pub async fn sign(&self, target: &Path) -> Result<()> {
        Command::new("sbctl")
            .arg("sign")
            .arg("-s")
            .arg(target)
            .run()
            .await
            .with_context(|| format!("Failed to sign {target:?}"))?;
        Ok(())
    }

    /// Sign every produced boot-chain binary. A failure on a non-critical
    /// target is a warning; a failure on the primary boot path is surfaced
    /// prominently (an unsigned primary image will not boot with enforcement
    /// on) but does not abort the remaining targets.
    pub async fn sign_all(&self, targets: &[SigningTarget]) {
        for target in targets {
            if !target.path.exists() {
                tracing::debug!(path = ?target.path, "signing target absent, skipping");
                continue;
            }
            match self.sign(&target.path).await {
                Ok(()) => tracing::info!(path = ?target.path, "signed"),
                Err(e) if target.critical => {
                    tracing::error!(
                        path = ?target.path,
                        "FAILED to sign a primary boot binary; the system will \
                         not boot with Secure Boot enforcement enabled: {e:#}"
                    );
                }
                Err(e) => {
                    tracing::warn!(path = ?target.path, "failed to sign: {e:#}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_keys_are_not_enrolled() {
        let keys = SecureBootKeys { enrolled: false };
        assert!(!keys.is_enrolled());
    }
}
