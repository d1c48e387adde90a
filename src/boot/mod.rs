//! Kernel, initramfs and bootloader configuration for the live image.
//!
//! The build tree ships bootloader templates; this module fills in the
//! pieces that come from the host: a kernel copied from `/boot`, an
//! initramfs generated for it, and operator edits to the boot menus.
//!
//! Progress is tracked through flags in [`PipelineConfig`]. Callers persist
//! the config after each operation.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::PipelineConfig;
use crate::error::StageError;
use crate::process::{Cmd, Runner};
use crate::profile::{DistroProfile, InitramfsTool};

/// Installer branding descriptor edited on the host.
pub const BRANDING_DESC: &str = "/usr/share/calamares/branding/live-builder/branding.desc";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootProgress {
    NotStarted,
    KernelSelected,
    InitramfsGenerated,
}

impl BootProgress {
    pub fn of(config: &PipelineConfig) -> Self {
        if config.kernel_image_path.is_empty() {
            BootProgress::NotStarted
        } else if config.initramfs_generated {
            BootProgress::InitramfsGenerated
        } else {
            BootProgress::KernelSelected
        }
    }
}

/// A text file handed to the operator's editor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootConfigKind {
    /// GRUB menu in the build tree.
    Grub,
    /// isolinux boot text in the build tree.
    BootText,
    /// Installer branding on the host.
    Branding,
}

impl BootConfigKind {
    pub fn path(self, profile: &DistroProfile, build_root: &Path) -> PathBuf {
        match self {
            BootConfigKind::Grub => build_root.join(profile.grub_cfg),
            BootConfigKind::BootText => build_root.join(profile.isolinux_cfg),
            BootConfigKind::Branding => PathBuf::from(BRANDING_DESC),
        }
    }

    fn mark_edited(self, config: &mut PipelineConfig) {
        match self {
            BootConfigKind::Grub => config.boot_config_edited = true,
            BootConfigKind::BootText => config.boot_text_edited = true,
            BootConfigKind::Branding => config.branding_edited = true,
        }
    }
}

/// `vmlinuz*` files in `boot_dir`, sorted by name.
pub fn list_kernels(boot_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut kernels = Vec::new();
    for entry in fs::read_dir(boot_dir)
        .with_context(|| format!("reading boot directory '{}'", boot_dir.display()))?
    {
        let entry = entry.with_context(|| format!("iterating '{}'", boot_dir.display()))?;
        let path = entry.path();
        let is_kernel = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with("vmlinuz"));
        if is_kernel && path.is_file() {
            kernels.push(path);
        }
    }
    kernels.sort();
    Ok(kernels)
}

/// Kernel release encoded in a `vmlinuz-<release>` file name.
pub fn kernel_version(kernel: &Path) -> Option<String> {
    kernel
        .file_name()?
        .to_str()?
        .strip_prefix("vmlinuz-")
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Copy `candidate` into the build tree and record it.
///
/// A new kernel invalidates any initramfs generated for the previous one.
pub fn select_kernel(
    config: &mut PipelineConfig,
    profile: &DistroProfile,
    build_root: &Path,
    candidate: &Path,
) -> Result<PathBuf> {
    if !candidate.is_file() {
        return Err(StageError::invalid_input(
            "kernel",
            format!("{} is not a file", candidate.display()),
        )
        .into());
    }
    let source_name = candidate
        .file_name()
        .and_then(|n| n.to_str())
        .context("kernel file name is not valid UTF-8")?;
    let dest = profile.kernel_dest(build_root, source_name);
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating '{}'", parent.display()))?;
    }
    fs::copy(candidate, &dest).with_context(|| {
        format!(
            "copying kernel '{}' to '{}'",
            candidate.display(),
            dest.display()
        )
    })?;

    info!(kernel = %dest.display(), "kernel selected");
    config.kernel_image_path = dest.display().to_string();
    config.initramfs_generated = false;
    Ok(dest)
}

/// Generate the initramfs for the selected kernel.
pub fn generate_initramfs(
    runner: &dyn Runner,
    config: &mut PipelineConfig,
    profile: &DistroProfile,
    build_root: &Path,
) -> Result<PathBuf> {
    if config.kernel_image_path.is_empty() {
        return Err(StageError::precondition("initramfs", vec!["kernelImagePath".into()]).into());
    }
    let kernel = PathBuf::from(&config.kernel_image_path);

    let output = match profile.initramfs_tool {
        InitramfsTool::Mkinitcpio => {
            let output = profile.initramfs_dest(build_root, "");
            let conf = build_root.join("mkinitcpio.conf");
            if !conf.is_file() {
                bail!(
                    "mkinitcpio.conf not found in the build tree: {}\n\
                     The build tree template must provide it.",
                    conf.display()
                );
            }
            println!("Generating initramfs with mkinitcpio...");
            runner.run(
                &Cmd::new("mkinitcpio")
                    .arg("-c")
                    .arg_path(&conf)
                    .arg("-k")
                    .arg_path(&kernel)
                    .arg("-g")
                    .arg_path(&output)
                    .error_msg("mkinitcpio failed. Install mkinitcpio-archiso."),
            )?;
            output
        }
        InitramfsTool::Mkinitramfs => {
            let version = match kernel_version(&kernel) {
                Some(version) => version,
                None => runner
                    .capture(&Cmd::new("uname").arg("-r"))?
                    .stdout
                    .trim()
                    .to_string(),
            };
            let output = profile.initramfs_dest(build_root, &version);
            println!("Generating initramfs with mkinitramfs for {}...", version);
            runner.run(
                &Cmd::new("mkinitramfs")
                    .arg("-o")
                    .arg_path(&output)
                    .arg(&version)
                    .error_msg("mkinitramfs failed. Install initramfs-tools and live-boot."),
            )?;
            output
        }
    };

    config.initramfs_generated = true;
    Ok(output)
}

/// Open a boot configuration file in the configured editor.
///
/// The matching flag is set once the editor exits, whether or not the
/// content changed.
pub fn expose_boot_config(
    runner: &dyn Runner,
    config: &mut PipelineConfig,
    profile: &DistroProfile,
    build_root: &Path,
    kind: BootConfigKind,
) -> Result<PathBuf> {
    let path = kind.path(profile, build_root);
    if !path.is_file() {
        bail!(
            "{} not found.\nPopulate the build tree before editing boot configuration.",
            path.display()
        );
    }
    runner.run(
        &Cmd::new(config.editor())
            .arg_path(&path)
            .error_msg(format!("Editor '{}' failed", config.editor())),
    )?;
    kind.mark_edited(config);
    Ok(path)
}
