//! Second-stage system configuration, executed inside the new root.
//!
//! Every step here is fail-fast: a failure aborts the remainder of the stage,
//! matching the outer pipeline's policy.

use anyhow::{Context as _, Result};
use tokio::process::Command;

use crate::{
    config::{Credentials, Identity},
    fs::cmd::CheckCommandOutput as _,
};

/// Initramfs hook list for an encrypted btrfs root: the unlock hook must run
/// after block device discovery and before filesystem mounting, and the
/// keyboard/keymap hooks must be early enough to type the passphrase.
const ROOT_HOOKS: &[&str] = &[
    "base",
    "udev",
    "autodetect",
    "modconf",
    "kms",
    "keyboard",
    "keymap",
    "consolefont",
    "block",
    "encrypt",
    "btrfs",
    "filesystems",
    "fsck",
];

pub async fn set_identity(identity: &Identity) -> Result<()> {
    tokio::fs::write("/etc/hostname", format!("{}\n", identity.hostname))
        .await
        .context("Failed to write /etc/hostname")?;

    let hosts = format!(
        "127.0.0.1\tlocalhost\n::1\t\tlocalhost\n127.0.1.1\t{}\n",
        identity.hostname
    );
    tokio::fs::write("/etc/hosts", hosts)
        .await
        .context("Failed to write /etc/hosts")?;

    Ok(())
}

pub async fn set_locale(identity: &Identity) -> Result<()> {
    let locale_gen = tokio::fs::read_to_string("/etc/locale.gen")
        .await
        .unwrap_or_default();
    tokio::fs::write("/etc/locale.gen", enable_locale(&locale_gen, &identity.locale))
        .await
        .context("Failed to write /etc/locale.gen")?;

    Command::new("locale-gen")
        .run()
        .await
        .context("Failed to regenerate locale data")?;

    tokio::fs::write("/etc/locale.conf", format!("LANG={}\n", identity.locale))
        .await
        .context("Failed to write /etc/locale.conf")?;

    tokio::fs::write("/etc/vconsole.conf", format!("KEYMAP={}\n", identity.keymap))
        .await
        .context("Failed to write /etc/vconsole.conf")?;

    Ok(())
}

pub async fn set_timezone(identity: &Identity) -> Result<()> {
    let zoneinfo = format!("/usr/share/zoneinfo/{}", identity.timezone);
    let _ = tokio::fs::remove_file("/etc/localtime").await;
    tokio::fs::symlink(&zoneinfo, "/etc/localtime")
        .await
        .with_context(|| format!("Failed to link /etc/localtime to {zoneinfo}"))?;

    Command::new("hwclock")
        .arg("--systohc")
        .run()
        .await
        .context("Failed to write the hardware clock")?;

    Ok(())
}

pub async fn set_credentials(identity: &Identity, credentials: &Credentials) -> Result<()> {
    Command::new("chpasswd")
        .run_with_input(format!("root:{}\n", credentials.root_password).as_bytes())
        .await
        .context("Failed to set the root password")?;

    Command::new("useradd")
        .args(["-m", "-G", "wheel", "-s", "/bin/bash"])
        .arg(&identity.username)
        .run()
        .await
        .with_context(|| format!("Failed to create user {}", identity.username))?;

    Command::new("chpasswd")
        .run_with_input(
            format!("{}:{}\n", identity.username, credentials.user_password).as_bytes(),
        )
        .await
        .with_context(|| format!("Failed to set the password for {}", identity.username))?;

    write_sudoers_dropin().await?;

    Ok(())
}

async fn write_sudoers_dropin() -> Result<()> {
    use std::os::unix::fs::PermissionsExt as _;

    let path = "/etc/sudoers.d/10-wheel";
    tokio::fs::write(path, "%wheel ALL=(ALL:ALL) ALL\n")
        .await
        .context("Failed to write the sudoers drop-in")?;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o440))
        .await
        .context("Failed to restrict the sudoers drop-in")?;
    Ok(())
}

/// Rewrite the initramfs hook list and rebuild the images for every installed
/// kernel preset.
pub async fn rebuild_initramfs() -> Result<()> {
    let conf = tokio::fs::read_to_string("/etc/mkinitcpio.conf")
        .await
        .context("Failed to read /etc/mkinitcpio.conf")?;
    tokio::fs::write("/etc/mkinitcpio.conf", rewrite_hooks(&conf, ROOT_HOOKS))
        .await
        .context("Failed to write /etc/mkinitcpio.conf")?;

    Command::new("mkinitcpio")
        .arg("-P")
        .run()
        .await
        .context("Failed to rebuild the initial RAM images")?;

    Ok(())
}

pub async fn enable_services(services: &[String]) -> Result<()> {
    for service in services {
        Command::new("systemctl")
            .arg("enable")
            .arg(service)
            .run()
            .await
            .with_context(|| format!("Failed to enable service {service}"))?;
    }
    Ok(())
}

/// Replace the active HOOKS= line, leaving everything else untouched. Pure so
/// the rewrite is testable without a root filesystem.
fn rewrite_hooks(content: &str, hooks: &[&str]) -> String {
    let hooks_line = format!("HOOKS=({})", hooks.join(" "));
    let mut replaced = false;

    let mut lines: Vec<String> = content
        .lines()
        .map(|line| {
            if line.trim_start().starts_with("HOOKS=") && !replaced {
                replaced = true;
                hooks_line.clone()
            } else {
                line.to_owned()
            }
        })
        .collect();

    if !replaced {
        lines.push(hooks_line);
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// Uncomment (or append) the requested locale in locale.gen.
fn enable_locale(content: &str, locale: &str) -> String {
    let mut found = false;

    let mut lines: Vec<String> = content
        .lines()
        .map(|line| {
            let uncommented = line.trim_start().trim_start_matches('#').trim_start();
            if uncommented.starts_with(locale) {
                found = true;
                uncommented.to_owned()
            } else {
                line.to_owned()
            }
        })
        .collect();

    if !found {
        lines.push(format!("{locale} UTF-8"));
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hooks_line_is_replaced_in_place() {
        let conf = "MODULES=()\nHOOKS=(base udev filesystems)\nCOMPRESSION=zstd\n";
        let out = rewrite_hooks(conf, ROOT_HOOKS);
        assert!(out.contains("MODULES=()"));
        assert!(out.contains("COMPRESSION=zstd"));
        assert_eq!(out.matches("HOOKS=").count(), 1);
        assert!(out.contains("encrypt btrfs filesystems"));
    }

    #[test]
    fn unlock_hook_precedes_filesystems() {
        let encrypt = ROOT_HOOKS.iter().position(|h| *h == "encrypt").unwrap();
        let block = ROOT_HOOKS.iter().position(|h| *h == "block").unwrap();
        let filesystems = ROOT_HOOKS.iter().position(|h| *h == "filesystems").unwrap();
        let keyboard = ROOT_HOOKS.iter().position(|h| *h == "keyboard").unwrap();
        assert!(block < encrypt);
        assert!(encrypt < filesystems);
        assert!(keyboard < encrypt);
    }

    #[test]
    fn missing_hooks_line_is_appended() {
        let out = rewrite_hooks("MODULES=()\n", ROOT_HOOKS);
        assert!(out.contains("HOOKS=(base udev"));
    }

    #[test]
    fn commented_locale_is_uncommented() {
        let gen = "#de_DE.UTF-8 UTF-8\n#en_US.UTF-8 UTF-8\n";
        let out = enable_locale(gen, "en_US.UTF-8");
        assert!(out.contains("\nen_US.UTF-8 UTF-8"));
        assert!(out.contains("#de_DE.UTF-8"));
    }

    #[test]
    fn unknown_locale_is_appended() {
        let out = enable_locale("#en_US.UTF-8 UTF-8\n", "xx_YY.UTF-8");
        assert!(out.ends_with("xx_YY.UTF-8 UTF-8\n"));
    }
}
