//! Materialize and launch the second provisioning stage inside the new root.
//!
//! All parameters are frozen here: the stage-2 parameter file and the runner
//! script are rendered from fixed templates with every field substituted, and
//! the runner is invoked with no arguments across the chroot boundary.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;

use anyhow::{bail, Context as _, Result};
use tokio::process::Command;

use crate::config::StageParams;

use super::template;

pub const STAGE2_PARAMS_PATH: &str = "etc/vaultstrap/stage2.toml";
pub const STAGE2_RUNNER_PATH: &str = "vaultstrap-stage2";
pub const STAGE2_BINARY_PATH: &str = "usr/local/bin/vaultstrap";

const STAGE2_TEMPLATE: &str = r#"# Generated by `vaultstrap provision`; consumed once by the second stage.
disk = @DISK@
root_partition = @ROOT_PARTITION@
swap_size_gib = @SWAP_SIZE_GIB@
services = @SERVICES@
enroll_vendor_keys = @ENROLL_VENDOR_KEYS@

[identity]
hostname = @HOSTNAME@
username = @USERNAME@
timezone = @TIMEZONE@
locale = @LOCALE@
keymap = @KEYMAP@

[credentials]
root_password = @ROOT_PASSWORD@
user_password = @USER_PASSWORD@

[hardware]
@CPU_VENDOR@
gpu = @GPU@
"#;

const RUNNER_TEMPLATE: &str = r#"#!/bin/sh
# Generated by vaultstrap; runs the second provisioning stage.
set -eu
exec /@BINARY@ configure --params /@PARAMS_PATH@
"#;

/// Quote a value as a TOML basic string. The value stays opaque; this only
/// protects the surrounding document structure. Basic strings forbid raw
/// control characters, so those are escaped too, not just quotes.
fn toml_string(value: &str) -> String {
    use std::fmt::Write as _;

    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        match c {
            '\\' => quoted.push_str("\\\\"),
            '"' => quoted.push_str("\\\""),
            '\n' => quoted.push_str("\\n"),
            '\t' => quoted.push_str("\\t"),
            '\r' => quoted.push_str("\\r"),
            c if (c as u32) < 0x20 || c == '\u{7f}' => {
                let _ = write!(quoted, "\\u{:04X}", c as u32);
            }
            c => quoted.push(c),
        }
    }
    quoted.push('"');
    quoted
}

fn toml_string_array(values: &[String]) -> String {
    let items: Vec<String> = values.iter().map(|v| toml_string(v)).collect();
    format!("[{}]", items.join(", "))
}

/// The full binding set for the stage-2 parameter template. Kept in one place
/// so the template/parameter-set diff test can see both sides.
pub fn stage_bindings(params: &StageParams) -> BTreeMap<&'static str, String> {
    let mut bindings = BTreeMap::new();
    bindings.insert("DISK", toml_string(&params.disk.to_string_lossy()));
    bindings.insert(
        "ROOT_PARTITION",
        toml_string(&params.root_partition.to_string_lossy()),
    );
    bindings.insert("SWAP_SIZE_GIB", params.swap_size_gib.to_string());
    bindings.insert("SERVICES", toml_string_array(&params.services));
    bindings.insert("ENROLL_VENDOR_KEYS", params.enroll_vendor_keys.to_string());
    bindings.insert("HOSTNAME", toml_string(&params.identity.hostname));
    bindings.insert("USERNAME", toml_string(&params.identity.username));
    bindings.insert("TIMEZONE", toml_string(&params.identity.timezone));
    bindings.insert("LOCALE", toml_string(&params.identity.locale));
    bindings.insert("KEYMAP", toml_string(&params.identity.keymap));
    bindings.insert(
        "ROOT_PASSWORD",
        toml_string(&params.credentials.root_password),
    );
    bindings.insert(
        "USER_PASSWORD",
        toml_string(&params.credentials.user_password),
    );
    bindings.insert(
        "CPU_VENDOR",
        match params.hardware.cpu_vendor {
            Some(vendor) => format!("cpu_vendor = {}", toml_string(&vendor.to_string())),
            None => String::new(),
        },
    );
    bindings.insert("GPU", toml_string(&params.hardware.gpu.to_string()));
    bindings
}

pub fn render_stage_params(params: &StageParams) -> Result<String> {
    template::render(STAGE2_TEMPLATE, &stage_bindings(params))
        .context("stage-2 parameter template does not match the parameter set")
}

fn render_runner() -> Result<String> {
    let mut bindings = BTreeMap::new();
    bindings.insert("BINARY", STAGE2_BINARY_PATH.to_owned());
    bindings.insert("PARAMS_PATH", STAGE2_PARAMS_PATH.to_owned());
    template::render(RUNNER_TEMPLATE, &bindings)
        .context("stage-2 runner template does not match its bindings")
}

async fn write_with_mode(path: &Path, content: &str, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt as _;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {parent:?}"))?;
    }
    tokio::fs::write(path, content)
        .await
        .with_context(|| format!("Failed to write {path:?}"))?;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .await
        .with_context(|| format!("Failed to set permissions on {path:?}"))?;
    Ok(())
}

/// Freeze the parameters into the new root, install the runner and our own
/// binary there, and execute the second stage with the new root as its
/// filesystem root.
pub async fn hand_off(mount_root: &Path, params: &StageParams) -> Result<()> {
    // Credentials live in this file; keep it root-only.
    write_with_mode(
        &mount_root.join(STAGE2_PARAMS_PATH),
        &render_stage_params(params)?,
        0o600,
    )
    .await?;

    write_with_mode(&mount_root.join(STAGE2_RUNNER_PATH), &render_runner()?, 0o755).await?;

    let current_exe = std::env::current_exe().context("Failed to locate our own binary")?;
    let binary_target = mount_root.join(STAGE2_BINARY_PATH);
    if let Some(parent) = binary_target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::copy(&current_exe, &binary_target)
        .await
        .context("Failed to copy the vaultstrap binary into the new root")?;

    tracing::info!("entering the new root for the second stage");

    // Stage-2 output streams straight to the operator; nothing useful comes
    // back on stdout.
    let status = Command::new("arch-chroot")
        .arg(mount_root)
        .arg(format!("/{STAGE2_RUNNER_PATH}"))
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .await
        .context("Failed to enter the new root")?;

    if !status.success() {
        bail!("Second-stage configuration failed with {status}");
    }

    tokio::fs::remove_file(mount_root.join(STAGE2_RUNNER_PATH))
        .await
        .context("Failed to remove the stage-2 runner")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Credentials, Hardware, Identity};
    use crate::types::{CpuVendor, GpuFamily};

    fn sample_params() -> StageParams {
        StageParams {
            disk: "/dev/sdb".into(),
            root_partition: "/dev/sdb2".into(),
            swap_size_gib: 8,
            identity: Identity {
                hostname: "anvil".into(),
                username: "smith".into(),
                timezone: "Europe/Berlin".into(),
                locale: "en_US.UTF-8".into(),
                keymap: "us".into(),
            },
            credentials: Credentials {
                root_password: "r\"quoted\"".into(),
                user_password: "u".into(),
            },
            hardware: Hardware {
                cpu_vendor: Some(CpuVendor::Amd),
                gpu: GpuFamily::Amd,
            },
            services: vec!["NetworkManager".into()],
            enroll_vendor_keys: true,
        }
    }

    #[test]
    fn every_placeholder_has_exactly_one_binding() {
        let bindings = stage_bindings(&sample_params());
        let names = template::placeholders(STAGE2_TEMPLATE);

        let bound: Vec<_> = bindings.keys().map(|k| (*k).to_owned()).collect();
        let named: Vec<_> = names.into_iter().collect();
        assert_eq!(bound, named);
    }

    #[test]
    fn rendered_params_parse_back_identically() {
        let params = sample_params();
        let rendered = render_stage_params(&params).unwrap();
        let parsed: StageParams = toml::from_str(&rendered).unwrap();

        assert_eq!(parsed.root_partition, params.root_partition);
        assert_eq!(parsed.identity.hostname, params.identity.hostname);
        assert_eq!(parsed.credentials.root_password, params.credentials.root_password);
        assert_eq!(parsed.hardware.cpu_vendor, Some(CpuVendor::Amd));
        assert_eq!(parsed.hardware.gpu, GpuFamily::Amd);
        assert_eq!(parsed.services, params.services);
    }

    #[test]
    fn absent_cpu_vendor_renders_valid_toml() {
        let mut params = sample_params();
        params.hardware.cpu_vendor = None;
        let rendered = render_stage_params(&params).unwrap();
        let parsed: StageParams = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.hardware.cpu_vendor, None);
    }

    #[test]
    fn multi_line_password_survives_the_round_trip() {
        // The intake config accepts multi-line TOML strings, so credentials
        // may carry raw newlines and tabs.
        let mut params = sample_params();
        params.credentials.root_password = "line1\nline2\ttabbed\r".into();
        params.credentials.user_password = "bell\u{7}".into();

        let rendered = render_stage_params(&params).unwrap();
        let parsed: StageParams = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.credentials.root_password, params.credentials.root_password);
        assert_eq!(parsed.credentials.user_password, params.credentials.user_password);
    }

    #[test]
    fn placeholder_like_values_do_not_expand() {
        let mut params = sample_params();
        params.identity.hostname = "@DISK@".into();
        let rendered = render_stage_params(&params).unwrap();
        let parsed: StageParams = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.identity.hostname, "@DISK@");
    }

    #[test]
    fn runner_template_renders() {
        let runner = render_runner().unwrap();
        assert!(runner.starts_with("#!/bin/sh"));
        assert!(runner.contains("/usr/local/bin/vaultstrap configure"));
        assert!(runner.contains("/etc/vaultstrap/stage2.toml"));
    }
}
