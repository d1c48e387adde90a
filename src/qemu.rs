//! Booting a finished ISO in QEMU.
//!
//! Provides [`QemuBuilder`] for the `qemu-system-x86_64` command line,
//! [`find_ovmf`] for UEFI firmware discovery and [`boot_iso`], which hands
//! the ISO to an interactive QEMU window so the operator can check it boots
//! before writing it to real media.

use anyhow::{bail, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::process::{Cmd, Runner};

pub const QEMU_BINARY: &str = "qemu-system-x86_64";

const DEFAULT_MEMORY_MB: u32 = 4000;
const DEFAULT_SMP: u32 = 2;

/// Builder for the QEMU command line.
#[derive(Debug, Clone)]
pub struct QemuBuilder {
    cdrom: Option<PathBuf>,
    ovmf: Option<PathBuf>,
    memory_mb: u32,
    smp: u32,
    kvm: bool,
}

impl Default for QemuBuilder {
    fn default() -> Self {
        Self {
            cdrom: None,
            ovmf: None,
            memory_mb: DEFAULT_MEMORY_MB,
            smp: DEFAULT_SMP,
            kvm: false,
        }
    }
}

impl QemuBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cdrom(mut self, path: &Path) -> Self {
        self.cdrom = Some(path.to_path_buf());
        self
    }

    /// Boot through OVMF instead of SeaBIOS.
    pub fn uefi(mut self, ovmf: &Path) -> Self {
        self.ovmf = Some(ovmf.to_path_buf());
        self
    }

    pub fn memory_mb(mut self, memory_mb: u32) -> Self {
        self.memory_mb = memory_mb;
        self
    }

    pub fn kvm(mut self, enabled: bool) -> Self {
        self.kvm = enabled;
        self
    }

    pub fn build(self) -> Cmd {
        let mut cmd = Cmd::new(QEMU_BINARY)
            .args(["-m", self.memory_mb.to_string().as_str()])
            .args(["-smp", self.smp.to_string().as_str()]);

        if self.kvm {
            cmd = cmd.args(["-accel", "kvm", "-cpu", "host"]);
        }

        if let Some(ovmf) = &self.ovmf {
            cmd = cmd.arg("-drive").arg(format!(
                "if=pflash,format=raw,readonly=on,file={}",
                ovmf.display()
            ));
        }

        if let Some(cdrom) = &self.cdrom {
            cmd = cmd.arg("-cdrom").arg_path(cdrom);
        }

        cmd.args(["-netdev", "user,id=net0", "-device", "virtio-net-pci,netdev=net0"])
            .error_msg(
                "QEMU failed. Install it:\n\
                 On Arch: sudo pacman -S qemu-desktop\n\
                 On Debian/Ubuntu: sudo apt-get install qemu-system-x86",
            )
    }
}

/// Find OVMF firmware for UEFI boot.
pub fn find_ovmf() -> Option<PathBuf> {
    let candidates = [
        // Arch
        "/usr/share/edk2/x64/OVMF_CODE.4m.fd",
        "/usr/share/edk2-ovmf/x64/OVMF_CODE.fd",
        // Debian/Ubuntu
        "/usr/share/OVMF/OVMF_CODE_4M.fd",
        "/usr/share/OVMF/OVMF_CODE.fd",
        "/usr/share/qemu/OVMF.fd",
    ];
    candidates.iter().map(PathBuf::from).find(|p| p.exists())
}

/// Most recently modified of `isos`.
pub fn newest(isos: &[PathBuf]) -> Option<PathBuf> {
    isos.iter()
        .filter_map(|path| {
            let modified = fs::metadata(path).and_then(|m| m.modified()).ok()?;
            Some((modified, path))
        })
        .max_by_key(|(modified, _)| *modified)
        .map(|(_, path)| path.clone())
}

/// Boot `iso` in QEMU and wait for the window to close.
///
/// `ovmf` selects UEFI boot. KVM is used when `/dev/kvm` exists.
pub fn boot_iso(runner: &dyn Runner, iso: &Path, ovmf: Option<&Path>, kvm: bool) -> Result<()> {
    if !iso.is_file() {
        bail!("ISO not found at {}. Build one first.", iso.display());
    }

    let mut builder = QemuBuilder::new().cdrom(iso).kvm(kvm);
    if let Some(ovmf) = ovmf {
        builder = builder.uefi(ovmf);
    }

    println!(
        "=== Booting {} in QEMU ({}) ===\n",
        iso.display(),
        if ovmf.is_some() { "UEFI" } else { "BIOS" }
    );
    runner.run(&builder.build())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::testing::RecordingRunner;
    use tempfile::TempDir;

    #[test]
    fn bios_boot_command() {
        let cmd = QemuBuilder::new()
            .cdrom(Path::new("/out/demo.iso"))
            .kvm(true)
            .build()
            .to_string();
        assert_eq!(
            cmd,
            "qemu-system-x86_64 -m 4000 -smp 2 -accel kvm -cpu host -cdrom /out/demo.iso \
             -netdev user,id=net0 -device virtio-net-pci,netdev=net0"
        );
    }

    #[test]
    fn uefi_adds_firmware_drive_without_kvm() {
        let cmd = QemuBuilder::new()
            .cdrom(Path::new("/out/demo.iso"))
            .uefi(Path::new("/usr/share/OVMF/OVMF_CODE.fd"))
            .memory_mb(2048)
            .build()
            .to_string();
        assert!(cmd.starts_with("qemu-system-x86_64 -m 2048 -smp 2 -drive"));
        assert!(cmd.contains("if=pflash,format=raw,readonly=on,file=/usr/share/OVMF/OVMF_CODE.fd"));
        assert!(!cmd.contains("kvm"));
    }

    #[test]
    fn missing_iso_spawns_nothing() {
        let runner = RecordingRunner::new();
        let result = boot_iso(&runner, Path::new("/nonexistent/demo.iso"), None, false);
        assert!(result.is_err());
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn boots_existing_iso() {
        let tmp = TempDir::new().unwrap();
        let iso = tmp.path().join("demo.iso");
        fs::write(&iso, "iso").unwrap();
        let runner = RecordingRunner::new();

        boot_iso(&runner, &iso, None, false).unwrap();

        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].contains(&format!("-cdrom {}", iso.display())));
    }

    #[test]
    fn newest_picks_latest_modification() {
        let tmp = TempDir::new().unwrap();
        let old = tmp.path().join("a.iso");
        let new = tmp.path().join("b.iso");
        fs::write(&old, "1").unwrap();
        fs::write(&new, "2").unwrap();
        let past = std::time::SystemTime::now() - std::time::Duration::from_secs(3600);
        fs::File::options()
            .write(true)
            .open(&old)
            .unwrap()
            .set_modified(past)
            .unwrap();

        assert_eq!(newest(&[old, new.clone()]), Some(new));
        assert_eq!(newest(&[]), None);
    }
}
