use std::path::{Path, PathBuf};

use anyhow::{bail, Context as _, Result};
use tempfile::TempDir;
use tokio::process::Command;

use super::cmd::CheckCommandOutput as _;

pub async fn mount(dev: &Path, target: &Path, options: Option<&str>) -> Result<()> {
    let mut cmd = Command::new("mount");
    if let Some(options) = options {
        cmd.arg("-o").arg(options);
    }
    cmd.arg(dev)
        .arg(target)
        .run()
        .await
        .with_context(|| format!("Failed to mount {dev:?} at {target:?}"))?;
    Ok(())
}

pub async fn umount(target: &Path) -> Result<()> {
    Command::new("umount")
        .arg(target)
        .run()
        .await
        .with_context(|| format!("Failed to umount {target:?}"))?;
    Ok(())
}

/// Ordered record of everything we mounted. Unmounting walks the record in
/// strictly reverse order, so nested mount points never report busy.
#[derive(Debug, Default)]
pub struct MountStack {
    mounted: Vec<PathBuf>,
}

impl MountStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&mut self, dev: &Path, target: &Path, options: Option<&str>) -> Result<()> {
        mount(dev, target, options).await?;
        self.mounted.push(target.to_path_buf());
        Ok(())
    }

    pub fn mounted(&self) -> &[PathBuf] {
        &self.mounted
    }

    pub async fn unmount_all(mut self) -> Result<()> {
        while let Some(target) = self.mounted.pop() {
            umount(&target).await?;
        }
        Ok(())
    }
}

// Deliberately no Drop-side unmounting: on a fatal pipeline error the mounted
// tree is left in place for manual inspection, and `vaultstrap close` is the
// explicit unwind path.

/// Recursively unmount a tree we did not necessarily build ourselves, deepest
/// path first. Used by the `close` subcommand.
pub async fn umount_recursive(root: &Path) -> Result<()> {
    let stdout = Command::new("findmnt")
        .args(["--submounts", "--list", "--noheadings", "-o", "TARGET"])
        .arg(root)
        .run_with_status_checker(|code, stdout, _| match code {
            // findmnt exits 1 when nothing is mounted there
            0 | 1 => Ok(stdout),
            _ => bail!("Bad exit code"),
        })
        .await
        .with_context(|| format!("Failed to list mounts under {root:?}"))?;

    let targets = deepest_first(
        String::from_utf8_lossy(&stdout)
            .lines()
            .map(|l| l.trim().to_owned())
            .filter(|l| !l.is_empty())
            .collect(),
    );

    for target in targets {
        tracing::info!(%target, "unmounting");
        umount(Path::new(&target)).await?;
    }

    Ok(())
}

/// Order mount points so every target precedes all of its ancestors. A child
/// mount has strictly more path components than its parent, so sorting by
/// component depth (then length, for stability) gives a safe unmount order.
fn deepest_first(mut targets: Vec<String>) -> Vec<String> {
    targets.sort_by_key(|t| {
        std::cmp::Reverse((Path::new(t).components().count(), t.len()))
    });
    targets
}

/// Short-lived mount of a device at a temp dir, for operations that need the
/// filesystem visible (subvolume creation).
pub struct TmpMount {
    dir: TempDir,
}

impl TmpMount {
    pub async fn mount(dev: &Path) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("vaultstrap-mount-")
            .tempdir()?;
        mount(dev, dir.path(), None).await?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub async fn unmount(self) -> Result<()> {
        umount(self.dir.path()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn children_are_unmounted_before_their_parents() {
        let ordered = deepest_first(vec![
            "/mnt".to_owned(),
            "/mnt/boot".to_owned(),
            "/mnt/home".to_owned(),
            "/mnt/var".to_owned(),
            "/mnt/var/longdirectoryname".to_owned(),
            "/mnt/.snapshots".to_owned(),
        ]);

        let position = |t: &str| ordered.iter().position(|o| o == t).unwrap();
        for (child, parent) in [
            ("/mnt/boot", "/mnt"),
            ("/mnt/home", "/mnt"),
            ("/mnt/var", "/mnt"),
            ("/mnt/var/longdirectoryname", "/mnt/var"),
            ("/mnt/.snapshots", "/mnt"),
        ] {
            assert!(
                position(child) < position(parent),
                "{child} must be unmounted before {parent}"
            );
        }
        assert_eq!(ordered.last().map(String::as_str), Some("/mnt"));
    }

    #[test]
    fn sibling_depth_beats_name_length() {
        // A long sibling name must not outrank a deeper nested mount.
        let ordered = deepest_first(vec![
            "/mnt/averyveryverylongname".to_owned(),
            "/mnt/a/b".to_owned(),
        ]);
        assert_eq!(ordered[0], "/mnt/a/b");
    }
}
