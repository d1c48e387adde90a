//! Preflight checks for host tools.
//!
//! Each stage declares the programs it spawns. Checking them up front turns
//! a half-finished build into a single clear message.
//!
//! # Example
//!
//! ```rust
//! use live_builder::preflight::{command_exists, check_required_tools};
//!
//! if !command_exists("mksquashfs") {
//!     println!("squashfs-tools not installed");
//! }
//!
//! let tools = &[("mksquashfs", "squashfs-tools"), ("xorriso", "xorriso")];
//! if let Err(e) = check_required_tools(tools) {
//!     eprintln!("{}", e);
//! }
//! ```

use anyhow::{bail, Result};

use crate::artifact::block_image::FsKind;
use crate::disk::plan::ProvisionPlan;
use crate::profile::{BaseInstall, DistroProfile};

/// Check if a command exists in PATH.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Tools needed to clone and package a staging tree.
pub const IMAGE_TOOLS: &[(&str, &str)] = &[
    ("rsync", "rsync"),
    ("mksquashfs", "squashfs-tools"),
];

pub const ISO_TOOLS: &[(&str, &str)] = &[("xorriso", "xorriso / libisoburn")];

pub const MEDIA_TOOLS: &[(&str, &str)] = &[("dd", "coreutils")];

pub const QEMU_TOOLS: &[(&str, &str)] = &[("qemu-system-x86_64", "qemu-desktop / qemu-system-x86")];

/// Partitioning and mounting, whatever gets installed.
const DISK_TOOLS: &[(&str, &str)] = &[
    ("wipefs", "util-linux"),
    ("parted", "parted"),
    ("partprobe", "parted"),
    ("mkfs.vfat", "dosfstools"),
    ("mount", "util-linux"),
    ("umount", "util-linux"),
    ("chroot", "coreutils"),
    ("genfstab", "arch-install-scripts"),
];

/// A clone-based install copies the host, so the host's bootloader and
/// initramfs tooling is what runs in the chroot.
const CLONE_INSTALL_TOOLS: &[(&str, &str)] = &[
    ("rsync", "rsync"),
    ("grub-install", "grub2-common"),
    ("grub-mkconfig", "grub2-common"),
    ("update-initramfs", "initramfs-tools"),
];

fn filesystem_tools(fs_kind: FsKind) -> &'static [(&'static str, &'static str)] {
    match fs_kind {
        FsKind::Btrfs => &[("mkfs.btrfs", "btrfs-progs"), ("btrfs", "btrfs-progs")],
        FsKind::Ext4 => &[("mkfs.ext4", "e2fsprogs")],
    }
}

/// [`IMAGE_TOOLS`] plus what a `fs_kind` block image needs.
pub fn block_image_tools(fs_kind: FsKind) -> Vec<(&'static str, &'static str)> {
    let mut tools = IMAGE_TOOLS.to_vec();
    tools.push(("fallocate", "util-linux"));
    match fs_kind {
        FsKind::Btrfs => tools.push(("mkfs.btrfs", "btrfs-progs")),
        FsKind::Ext4 => tools.extend([
            ("mkfs.ext4", "e2fsprogs"),
            ("mount", "util-linux"),
            ("umount", "util-linux"),
        ]),
    }
    tools
}

/// Everything an install of `plan` onto a `fs_kind` disk spawns on the host.
pub fn install_tools(
    profile: &DistroProfile,
    fs_kind: FsKind,
    plan: &ProvisionPlan,
) -> Vec<(&'static str, &'static str)> {
    let mut tools = DISK_TOOLS.to_vec();
    tools.extend_from_slice(filesystem_tools(fs_kind));
    match profile.base_install {
        BaseInstall::Pacstrap => tools.push(("pacstrap", "arch-install-scripts")),
        BaseInstall::CloneLive => tools.extend_from_slice(CLONE_INSTALL_TOOLS),
    }
    if !plan.payloads.is_empty() {
        tools.push(("curl", "curl"));
    }
    if plan.payloads.iter().any(|p| p.unsquash) {
        tools.push(("unsquashfs", "squashfs-tools"));
    }
    tools
}

/// Check that specific tools are available.
///
/// Each tuple is (command, package). Returns an error listing every
/// missing tool with its package.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<_> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .collect();

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required host tools:\n{}", msg);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_exists() {
        assert!(command_exists("ls"));
        assert!(!command_exists("definitely_not_a_real_command_12345"));
    }

    #[test]
    fn test_check_required_tools_success() {
        let tools = &[("ls", "coreutils"), ("cat", "coreutils")];
        assert!(check_required_tools(tools).is_ok());
    }

    fn names(tools: &[(&str, &str)]) -> Vec<String> {
        tools.iter().map(|(t, _)| t.to_string()).collect()
    }

    #[test]
    fn clone_install_checks_host_bootloader_tools() {
        let profile = DistroProfile::ubuntu();
        let mut plan = ProvisionPlan::defaults(&profile);
        plan.payloads.push(crate::disk::plan::Payload {
            url: "https://example.org/home.sfs".into(),
            dest: "home".into(),
            unsquash: true,
        });

        let tools = names(&install_tools(&profile, FsKind::Ext4, &plan));

        for tool in ["wipefs", "genfstab", "rsync", "grub-install", "grub-mkconfig", "curl", "unsquashfs", "mkfs.ext4"] {
            assert!(tools.contains(&tool.to_string()), "missing {}", tool);
        }
        assert!(!tools.contains(&"mkfs.btrfs".to_string()));
        assert!(!tools.contains(&"pacstrap".to_string()));
    }

    #[test]
    fn pacstrap_install_skips_payload_tools_without_payloads() {
        let profile = DistroProfile::arch();
        let plan = ProvisionPlan::defaults(&profile);

        let tools = names(&install_tools(&profile, FsKind::Btrfs, &plan));

        assert!(tools.contains(&"pacstrap".to_string()));
        assert!(tools.contains(&"btrfs".to_string()));
        assert!(!tools.contains(&"curl".to_string()));
        assert!(!tools.contains(&"mkfs.ext4".to_string()));
    }

    #[test]
    fn ext4_block_image_needs_image_tools() {
        let tools = names(&block_image_tools(FsKind::Ext4));
        for tool in ["rsync", "mksquashfs", "fallocate", "mkfs.ext4", "mount"] {
            assert!(tools.contains(&tool.to_string()), "missing {}", tool);
        }
        assert!(!names(&block_image_tools(FsKind::Btrfs)).contains(&"mkfs.ext4".to_string()));
    }

    #[test]
    fn test_check_required_tools_failure() {
        let tools = &[("ls", "coreutils"), ("nonexistent_command_xyz", "fake-package")];
        let err = check_required_tools(tools).unwrap_err().to_string();
        assert!(err.contains("nonexistent_command_xyz (install: fake-package)"));
        assert!(!err.contains("ls (install"));
    }
}
