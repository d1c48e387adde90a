//! Per-distribution descriptors.
//!
//! A [`DistroProfile`] is chosen once from `/etc/os-release` and never
//! changes. Everything that differs between Arch, Ubuntu and Debian hosts
//! (package manifests, build tree layout, initramfs tooling) lives here so
//! the pipeline itself stays a single code path.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::process::Cmd;

pub const OS_RELEASE: &str = "/etc/os-release";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistroFamily {
    Arch,
    Ubuntu,
    Debian,
}

/// How the initramfs for the live image is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitramfsTool {
    /// `mkinitcpio -c <conf> -k <kernel> -g <out>`
    Mkinitcpio,
    /// `mkinitramfs -o <out> <version>`
    Mkinitramfs,
}

/// How the base system lands on a freshly provisioned disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseInstall {
    Pacstrap,
    CloneLive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistroProfile {
    pub family: DistroFamily,
    /// Build tree directory under the state dir.
    pub build_dir_name: &'static str,
    /// Where the packaged root filesystem lands in the build tree.
    pub squashfs_path: &'static str,
    /// Directory holding the kernel copy in the build tree.
    pub kernel_dir: &'static str,
    pub initramfs_tool: InitramfsTool,
    pub grub_cfg: &'static str,
    pub isolinux_cfg: &'static str,
    /// Hybrid MBR image handed to `--grub2-mbr`.
    pub hybrid_mbr: &'static str,
    /// BIOS El Torito image, relative to the ISO root.
    pub eltorito_image: &'static str,
    /// FAT image appended as the UEFI partition.
    pub efi_image: &'static str,
    pub packages: &'static [&'static str],
    pub base_install: BaseInstall,
    pub display_manager: &'static str,
    pub network_service: &'static str,
    /// Supplementary group that grants sudo to the installed user.
    pub admin_group: &'static str,
}

const ARCH_PACKAGES: &[&str] = &[
    "arch-install-scripts",
    "bash-completion",
    "dosfstools",
    "erofs-utils",
    "findutils",
    "grub",
    "jq",
    "libarchive",
    "libisoburn",
    "lsb-release",
    "lvm2",
    "mkinitcpio-archiso",
    "mkinitcpio-nfs-utils",
    "mtools",
    "nbd",
    "pacman-contrib",
    "parted",
    "procps-ng",
    "pv",
    "python",
    "rsync",
    "squashfs-tools",
    "sshfs",
    "syslinux",
    "xdg-utils",
    "zsh-completions",
    "kernel-modules-hook",
    "btrfs-progs",
];

const UBUNTU_PACKAGES: &[&str] = &[
    "cryptsetup",
    "dmeventd",
    "isolinux",
    "libaio-dev",
    "libcares2",
    "libdevmapper-event1.02.1",
    "liblvm2cmd2.03",
    "live-boot",
    "live-boot-doc",
    "live-boot-initramfs-tools",
    "live-config-systemd",
    "live-tools",
    "lvm2",
    "pxelinux",
    "syslinux",
    "syslinux-common",
    "thin-provisioning-tools",
    "squashfs-tools",
    "xorriso",
    "rsync",
    "btrfs-progs",
];

const DEBIAN_PACKAGES: &[&str] = &[
    "cryptsetup",
    "dmeventd",
    "isolinux",
    "libaio1",
    "libc-ares2",
    "libdevmapper-event1.02.1",
    "liblvm2cmd2.03",
    "live-boot",
    "live-boot-doc",
    "live-boot-initramfs-tools",
    "live-config-systemd",
    "live-tools",
    "lvm2",
    "pxelinux",
    "syslinux",
    "syslinux-common",
    "thin-provisioning-tools",
    "squashfs-tools",
    "xorriso",
    "rsync",
    "btrfs-progs",
];

impl DistroProfile {
    pub fn arch() -> Self {
        Self {
            family: DistroFamily::Arch,
            build_dir_name: "build-image-arch",
            squashfs_path: "arch/x86_64/airootfs.sfs",
            kernel_dir: "boot",
            initramfs_tool: InitramfsTool::Mkinitcpio,
            grub_cfg: "boot/grub/grub.cfg",
            isolinux_cfg: "isolinux/isolinux.cfg",
            hybrid_mbr: "boot/grub/i386-pc/boot_hybrid.img",
            eltorito_image: "boot/grub/i386-pc/eltorito.img",
            efi_image: "boot/efi.img",
            packages: ARCH_PACKAGES,
            base_install: BaseInstall::Pacstrap,
            display_manager: "sddm.service",
            network_service: "NetworkManager.service",
            admin_group: "wheel",
        }
    }

    pub fn ubuntu() -> Self {
        Self {
            family: DistroFamily::Ubuntu,
            build_dir_name: "build-image-noble",
            squashfs_path: "live/filesystem.sfs",
            kernel_dir: "live",
            initramfs_tool: InitramfsTool::Mkinitramfs,
            efi_image: "boot/grub/efi.img",
            packages: UBUNTU_PACKAGES,
            base_install: BaseInstall::CloneLive,
            display_manager: "gdm3.service",
            admin_group: "sudo",
            ..Self::arch()
        }
    }

    pub fn debian() -> Self {
        Self {
            family: DistroFamily::Debian,
            build_dir_name: "build-image-debian",
            efi_image: "boot/grub/efiboot.img",
            packages: DEBIAN_PACKAGES,
            display_manager: "lightdm.service",
            ..Self::ubuntu()
        }
    }

    /// Read and classify the host's os-release file.
    pub fn detect() -> Result<Self> {
        Self::detect_from(Path::new(OS_RELEASE))
    }

    pub fn detect_from(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading '{}'", path.display()))?;
        Self::from_os_release(&text)
    }

    /// Classify by `ID`, falling back to `ID_LIKE`.
    pub fn from_os_release(text: &str) -> Result<Self> {
        let mut id = String::new();
        let mut id_like = String::new();
        for line in text.lines() {
            if let Some((key, value)) = line.split_once('=') {
                let value = value.trim().trim_matches('"').to_ascii_lowercase();
                match key.trim() {
                    "ID" => id = value,
                    "ID_LIKE" => id_like = value,
                    _ => {}
                }
            }
        }

        let like = |name: &str| id_like.split_whitespace().any(|l| l == name);
        let profile = match id.as_str() {
            "arch" | "cachyos" | "endeavouros" | "manjaro" => Self::arch(),
            "ubuntu" | "neon" => Self::ubuntu(),
            "debian" => Self::debian(),
            _ if like("arch") => Self::arch(),
            _ if like("ubuntu") => Self::ubuntu(),
            _ if like("debian") => Self::debian(),
            _ => bail!(
                "Unsupported distribution '{}'.\n\
                 Supported: Arch (and derivatives), Ubuntu, Debian.",
                if id.is_empty() { "unknown" } else { id.as_str() }
            ),
        };
        Ok(profile)
    }

    pub fn name(&self) -> &'static str {
        match self.family {
            DistroFamily::Arch => "Arch",
            DistroFamily::Ubuntu => "Ubuntu",
            DistroFamily::Debian => "Debian",
        }
    }

    /// `<state_dir>/<build_dir_name>`
    pub fn build_root(&self, state_dir: &Path) -> PathBuf {
        state_dir.join(self.build_dir_name)
    }

    /// Architecture-qualified kernel name inside the build tree.
    ///
    /// Arch boots a fixed `vmlinuz-x86_64`; Debian-style trees keep the
    /// upstream name so the version can be recovered for `mkinitramfs`.
    pub fn kernel_dest(&self, build_root: &Path, source_name: &str) -> PathBuf {
        let name = match self.family {
            DistroFamily::Arch => "vmlinuz-x86_64".to_string(),
            _ => source_name.to_string(),
        };
        build_root.join(self.kernel_dir).join(name)
    }

    /// Where the generated initramfs is written.
    pub fn initramfs_dest(&self, build_root: &Path, kernel_version: &str) -> PathBuf {
        match self.family {
            DistroFamily::Arch => build_root.join("boot/initramfs-x86_64.img"),
            _ => build_root
                .join(self.kernel_dir)
                .join(format!("initrd.img-{}", kernel_version)),
        }
    }

    /// Command that installs the host dependency manifest.
    pub fn install_command(&self) -> Cmd {
        match self.family {
            DistroFamily::Arch => Cmd::new("pacman")
                .args(["-Sy", "--needed", "--noconfirm"])
                .args(self.packages)
                .error_msg("pacman failed to install host dependencies."),
            _ => Cmd::new("apt-get")
                .args(["install", "-y"])
                .args(self.packages)
                .error_msg("apt-get failed to install host dependencies. Try 'apt-get update' first."),
        }
    }

    /// Initramfs rebuild run inside a provisioned chroot.
    pub fn initramfs_rebuild_args(&self) -> &'static [&'static str] {
        match self.family {
            DistroFamily::Arch => &["mkinitcpio", "-P"],
            _ => &["update-initramfs", "-u", "-k", "all"],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivatives_map_to_arch() {
        let text = "NAME=\"CachyOS Linux\"\nID=cachyos\nID_LIKE=arch\n";
        assert_eq!(
            DistroProfile::from_os_release(text).unwrap().family,
            DistroFamily::Arch
        );
        let text = "ID=garuda\nID_LIKE=\"arch\"\n";
        assert_eq!(
            DistroProfile::from_os_release(text).unwrap().family,
            DistroFamily::Arch
        );
    }

    #[test]
    fn ubuntu_wins_over_debian_id_like() {
        let text = "ID=pop\nID_LIKE=\"ubuntu debian\"\n";
        assert_eq!(
            DistroProfile::from_os_release(text).unwrap().family,
            DistroFamily::Ubuntu
        );
        let text = "ID=debian\n";
        assert_eq!(
            DistroProfile::from_os_release(text).unwrap().family,
            DistroFamily::Debian
        );
    }

    #[test]
    fn unknown_distribution_is_rejected() {
        let err = DistroProfile::from_os_release("ID=fedora\n").unwrap_err();
        assert!(err.to_string().contains("fedora"));
    }

    #[test]
    fn kernel_and_initramfs_paths() {
        let root = Path::new("/state/build-image-debian");
        let debian = DistroProfile::debian();
        assert_eq!(
            debian.kernel_dest(root, "vmlinuz-6.1.0-18-amd64"),
            root.join("live/vmlinuz-6.1.0-18-amd64")
        );
        assert_eq!(
            debian.initramfs_dest(root, "6.1.0-18-amd64"),
            root.join("live/initrd.img-6.1.0-18-amd64")
        );

        let root = Path::new("/state/build-image-arch");
        let arch = DistroProfile::arch();
        assert_eq!(
            arch.kernel_dest(root, "vmlinuz-linux-zen"),
            root.join("boot/vmlinuz-x86_64")
        );
    }

    #[test]
    fn install_command_uses_profile_manager() {
        let cmd = DistroProfile::arch().install_command().to_string();
        assert!(cmd.starts_with("pacman -Sy --needed --noconfirm arch-install-scripts"));
        let cmd = DistroProfile::debian().install_command().to_string();
        assert!(cmd.starts_with("apt-get install -y cryptsetup"));
    }
}
