//! Unified Kernel Image composition.
//!
//! A UKI is the systemd EFI stub with four named PE sections added at fixed
//! virtual addresses. The layout is computed and validated up front (the
//! stub's ABI leaves no room for overlap), the objcopy invocation is derived
//! deterministically from it, and the produced binary is parsed back to check
//! the sections actually landed.

use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context as _, Result};
use object::{Object as _, ObjectSection as _};
use tokio::process::Command;

use crate::fs::cmd::CheckCommandOutput as _;

/// Section load addresses fixed by the stub-loader ABI.
pub const OSREL_VMA: u64 = 0x20000;
pub const CMDLINE_VMA: u64 = 0x30000;
pub const LINUX_VMA: u64 = 0x2000000;
pub const INITRD_VMA: u64 = 0x3000000;

#[derive(Debug, Clone)]
pub struct UkiSpec {
    /// OS release metadata blob (usually /usr/lib/os-release).
    pub os_release: PathBuf,
    /// Kernel command line; collapsed to a single line before embedding.
    pub cmdline: String,
    pub kernel: PathBuf,
    pub initrd: PathBuf,
    /// Early CPU microcode; prepended raw to the initrd bytes, never a
    /// section of its own.
    pub microcode: Option<PathBuf>,
    /// The stub loader the sections are grafted onto.
    pub stub: PathBuf,
    pub output: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlacedSection {
    pub name: &'static str,
    pub vma: u64,
    pub size: u64,
}

/// Validated section layout: ordered, in-range, non-overlapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UkiLayout {
    sections: Vec<PlacedSection>,
}

impl UkiLayout {
    /// Place the four sections given their byte sizes. Rejects any layout
    /// where a section would run into the next fixed address.
    pub fn place(
        os_release_size: u64,
        cmdline_size: u64,
        kernel_size: u64,
        initrd_size: u64,
    ) -> Result<Self> {
        let sections = vec![
            PlacedSection { name: ".osrel", vma: OSREL_VMA, size: os_release_size },
            PlacedSection { name: ".cmdline", vma: CMDLINE_VMA, size: cmdline_size },
            PlacedSection { name: ".linux", vma: LINUX_VMA, size: kernel_size },
            PlacedSection { name: ".initrd", vma: INITRD_VMA, size: initrd_size },
        ];

        for pair in sections.windows(2) {
            let (current, next) = (&pair[0], &pair[1]);
            let end = current
                .vma
                .checked_add(current.size)
                .context("section size overflows the address space")?;
            if end > next.vma {
                bail!(
                    "section {} ({} bytes at {:#x}) overlaps {} at {:#x}",
                    current.name,
                    current.size,
                    current.vma,
                    next.name,
                    next.vma
                );
            }
        }

        Ok(Self { sections })
    }

    pub fn sections(&self) -> &[PlacedSection] {
        &self.sections
    }

    /// The objcopy invocation for this layout. Given identical inputs the
    /// argument vector is byte-identical across runs.
    pub fn objcopy_args(
        &self,
        sources: &[&Path; 4],
        stub: &Path,
        output: &Path,
    ) -> Vec<String> {
        let mut args = Vec::new();
        for (section, source) in self.sections.iter().zip(sources) {
            args.push("--add-section".to_owned());
            args.push(format!("{}={}", section.name, source.display()));
            args.push("--change-section-vma".to_owned());
            args.push(format!("{}={:#x}", section.name, section.vma));
        }
        args.push(stub.display().to_string());
        args.push(output.display().to_string());
        args
    }
}

/// Compose one UKI from the spec.
pub async fn build(spec: &UkiSpec) -> Result<()> {
    // A missing input would not fail objcopy loudly, it would miscompose the
    // image; validate everything before touching the output.
    for (what, path) in [
        ("kernel", &spec.kernel),
        ("initrd", &spec.initrd),
        ("stub loader", &spec.stub),
        ("OS release file", &spec.os_release),
    ] {
        if !tokio::fs::try_exists(path).await? {
            bail!("Cannot build {:?}: {what} {path:?} is missing", spec.output);
        }
    }

    let combined_initrd = combined_initrd_path(&spec.output);
    // Stale state from an interrupted run must never leak into this build.
    let _ = tokio::fs::remove_file(&combined_initrd).await;
    crate::async_defer! {
        tokio::fs::remove_file(combined_initrd.clone())
    };

    write_combined_initrd(spec, &combined_initrd).await?;

    let cmdline_file = write_cmdline_blob(&spec.cmdline)?;

    let layout = UkiLayout::place(
        tokio::fs::metadata(&spec.os_release).await?.len(),
        tokio::fs::metadata(cmdline_file.path()).await?.len(),
        tokio::fs::metadata(&spec.kernel).await?.len(),
        tokio::fs::metadata(&combined_initrd).await?.len(),
    )?;

    let args = layout.objcopy_args(
        &[
            &spec.os_release,
            cmdline_file.path(),
            &spec.kernel,
            &combined_initrd,
        ],
        &spec.stub,
        &spec.output,
    );

    Command::new("objcopy")
        .args(&args)
        .run()
        .await
        .with_context(|| format!("Failed to compose {:?}", spec.output))?;

    let image = tokio::fs::read(&spec.output)
        .await
        .with_context(|| format!("Failed to read back {:?}", spec.output))?;
    verify_image(&image).with_context(|| format!("{:?} failed verification", spec.output))?;

    tracing::info!(output = ?spec.output, "composed unified kernel image");

    Ok(())
}

/// Check the composed binary parses as PE and carries the expected sections.
pub fn verify_image(image: &[u8]) -> Result<()> {
    let file = object::File::parse(image).context("Not a valid PE image")?;

    if !matches!(
        file.format(),
        object::BinaryFormat::Pe | object::BinaryFormat::Coff
    ) {
        bail!("Expected a PE or COFF executable, got {:?}", file.format());
    }

    for name in [".osrel", ".cmdline", ".linux", ".initrd"] {
        file.section_by_name(name)
            .with_context(|| format!("No {name} section in the composed image"))?;
    }

    Ok(())
}

fn combined_initrd_path(output: &Path) -> PathBuf {
    let mut name = output.file_name().unwrap_or_default().to_os_string();
    name.push(".initrd-combined");
    output.with_file_name(name)
}

/// Microcode must come first so the kernel's early loader can find it; the
/// two cpio archives are concatenated raw, not merged.
async fn write_combined_initrd(spec: &UkiSpec, target: &Path) -> Result<()> {
    let mut combined = Vec::new();

    if let Some(microcode) = &spec.microcode {
        combined = tokio::fs::read(microcode)
            .await
            .with_context(|| format!("Failed to read microcode image {microcode:?}"))?;
    }

    let initrd = tokio::fs::read(&spec.initrd)
        .await
        .with_context(|| format!("Failed to read initrd {:?}", spec.initrd))?;
    combined.extend_from_slice(&initrd);

    tokio::fs::write(target, combined)
        .await
        .with_context(|| format!("Failed to write combined initrd {target:?}"))?;

    Ok(())
}

/// The command line is embedded as a transient single-line blob.
fn write_cmdline_blob(cmdline: &str) -> Result<tempfile::NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("vaultstrap-cmdline-")
        .tempfile()
        .context("Failed to create command line blob")?;
    let single_line = cmdline.replace('\n', " ");
    file.write_all(single_line.trim().as_bytes())?;
    file.flush()?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_places_sections_at_fixed_addresses() {
        let layout = UkiLayout::place(512, 128, 12 << 20, 64 << 20).unwrap();
        let vmas: Vec<_> = layout.sections().iter().map(|s| s.vma).collect();
        assert_eq!(vmas, vec![OSREL_VMA, CMDLINE_VMA, LINUX_VMA, INITRD_VMA]);
    }

    #[test]
    fn oversized_kernel_is_rejected() {
        // A kernel larger than the gap to .initrd would overlap it.
        let err = UkiLayout::place(512, 128, (INITRD_VMA - LINUX_VMA) + 1, 1).unwrap_err();
        assert!(err.to_string().contains(".linux"));
    }

    #[test]
    fn oversized_os_release_is_rejected() {
        let err = UkiLayout::place((CMDLINE_VMA - OSREL_VMA) + 1, 1, 1, 1).unwrap_err();
        assert!(err.to_string().contains(".osrel"));
    }

    #[test]
    fn objcopy_args_are_deterministic() {
        let layout = UkiLayout::place(512, 128, 1024, 2048).unwrap();
        let sources: [&Path; 4] = [
            Path::new("/usr/lib/os-release"),
            Path::new("/tmp/cmdline"),
            Path::new("/boot/vmlinuz-linux"),
            Path::new("/boot/linux.efi.initrd-combined"),
        ];
        let stub = Path::new("/usr/lib/systemd/boot/efi/linuxx64.efi.stub");
        let output = Path::new("/boot/EFI/Linux/linux.efi");

        let first = layout.objcopy_args(&sources, stub, output);
        let second = layout.objcopy_args(&sources, stub, output);
        assert_eq!(first, second);

        assert_eq!(first[0], "--add-section");
        assert_eq!(first[1], ".osrel=/usr/lib/os-release");
        assert_eq!(first[3], ".osrel=0x20000");
        assert!(first.contains(&".linux=0x2000000".to_owned()));
        assert!(first.contains(&".initrd=0x3000000".to_owned()));
        assert_eq!(first.last().unwrap(), "/boot/EFI/Linux/linux.efi");
    }

    #[test]
    fn combined_initrd_path_is_next_to_the_output() {
        let path = combined_initrd_path(Path::new("/boot/EFI/Linux/linux.efi"));
        assert_eq!(
            path,
            Path::new("/boot/EFI/Linux/linux.efi.initrd-combined")
        );
    }

    #[test]
    fn cmdline_blob_is_a_single_line() {
        let file = write_cmdline_blob("root=/dev/mapper/root\nrw quiet\n").unwrap();
        let content = std::fs::read_to_string(file.path()).unwrap();
        assert!(!content.contains('\n'));
        assert_eq!(content, "root=/dev/mapper/root rw quiet");
    }
}
