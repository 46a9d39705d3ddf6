use std::path::Path;

use anyhow::{Context as _, Result};
use tokio::process::Command;

use super::cmd::CheckCommandOutput as _;

/// Generate the mount table for the mounted tree (UUID-referenced) and append
/// it to the new root's /etc/fstab.
pub async fn generate(mount_root: &Path) -> Result<()> {
    let stdout = Command::new("genfstab")
        .arg("-U")
        .arg(mount_root)
        .run()
        .await
        .context("Failed to generate the mount table")?;

    let fstab_path = mount_root.join("etc/fstab");
    let existing = tokio::fs::read_to_string(&fstab_path)
        .await
        .unwrap_or_default();
    let generated = String::from_utf8_lossy(&stdout);

    let mut content = existing;
    if !content.is_empty() && !content.ends_with('\n') {
        content.push('\n');
    }
    content.push_str(&generated);

    tokio::fs::write(&fstab_path, content)
        .await
        .with_context(|| format!("Failed to write {fstab_path:?}"))?;

    Ok(())
}

/// Append a mount-table line unless an equivalent entry (same device field)
/// is already present, so reruns never register the same entry twice.
pub async fn append_entry(fstab_path: &Path, line: &str) -> Result<()> {
    let existing = tokio::fs::read_to_string(fstab_path)
        .await
        .unwrap_or_default();

    if !needs_entry(&existing, line) {
        tracing::info!(%line, "mount table already carries this entry, skipping");
        return Ok(());
    }

    let mut content = existing;
    if !content.is_empty() && !content.ends_with('\n') {
        content.push('\n');
    }
    content.push_str(line);
    content.push('\n');

    tokio::fs::write(fstab_path, content)
        .await
        .with_context(|| format!("Failed to append to {fstab_path:?}"))?;

    Ok(())
}

pub fn swap_entry(swapfile: &str) -> String {
    format!("{swapfile}\tnone\tswap\tdefaults\t0\t0")
}

fn needs_entry(existing: &str, line: &str) -> bool {
    let device = match line.split_whitespace().next() {
        Some(device) => device,
        None => return false,
    };
    !existing
        .lines()
        .filter(|l| !l.trim_start().starts_with('#'))
        .any(|l| l.split_whitespace().next() == Some(device))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swap_entry_is_not_duplicated() {
        let line = swap_entry("/swapfile");
        let mut fstab = String::from("UUID=abcd / btrfs defaults 0 0\n");
        assert!(needs_entry(&fstab, &line));
        fstab.push_str(&line);
        fstab.push('\n');
        assert!(!needs_entry(&fstab, &line));
    }

    #[test]
    fn commented_entries_do_not_count() {
        let line = swap_entry("/swapfile");
        let fstab = "# /swapfile none swap defaults 0 0\n";
        assert!(needs_entry(fstab, &line));
    }

    #[tokio::test]
    async fn append_entry_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let fstab = dir.path().join("fstab");
        let line = swap_entry("/swapfile");

        append_entry(&fstab, &line).await.unwrap();
        append_entry(&fstab, &line).await.unwrap();

        let content = tokio::fs::read_to_string(&fstab).await.unwrap();
        assert_eq!(content.matches("/swapfile").count(), 1);
    }
}
