//! Bare-metal installation onto a target disk.
//!
//! [`DiskProvisioner`] walks a strictly linear state machine:
//!
//! ```text
//! Unpartitioned -> PartitionTablePresent -> Formatted -> Mounted
//!               -> Populated -> Provisioned -> TornDown
//! ```
//!
//! Calling a step out of order fails with `PreconditionNotMet` before
//! anything is spawned. [`DiskProvisioner::run_all`] drives every step and,
//! if one fails after the target is mounted, unmounts with allow-failure
//! and returns the original error.

mod chroot;
pub mod layout;
pub mod plan;

pub use chroot::rewrite_cmdline;
pub use layout::{partition_node, DiskLayout, PartitionRole};
pub use plan::ProvisionPlan;

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::artifact::block_image::FsKind;
use crate::clone::{self, ExcludeRules};
use crate::error::StageError;
use crate::process::{Cmd, Runner};
use crate::profile::{BaseInstall, DistroProfile};

/// Target root for installs.
pub const TARGET_ROOT: &str = "/mnt";

const BIND_MOUNTS: &[&str] = &["dev", "dev/pts", "proc", "sys", "run"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskState {
    Unpartitioned,
    PartitionTablePresent,
    Formatted,
    Mounted,
    Populated,
    Provisioned,
    TornDown,
}

impl DiskState {
    fn is_mounted(self) -> bool {
        matches!(
            self,
            DiskState::Mounted | DiskState::Populated | DiskState::Provisioned
        )
    }
}

/// Checks whether a device node exists.
pub trait NodeProbe {
    fn exists(&self, node: &Path) -> bool;
}

/// Looks at the real filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsProbe;

impl NodeProbe for FsProbe {
    fn exists(&self, node: &Path) -> bool {
        node.exists()
    }
}

pub struct DiskProvisioner<'a> {
    runner: &'a dyn Runner,
    probe: &'a dyn NodeProbe,
    layout: DiskLayout,
    target: PathBuf,
    state: DiskState,
    poll_interval: Duration,
    poll_attempts: u32,
}

impl<'a> DiskProvisioner<'a> {
    pub fn new(
        runner: &'a dyn Runner,
        probe: &'a dyn NodeProbe,
        layout: DiskLayout,
        target: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runner,
            probe,
            layout,
            target: target.into(),
            state: DiskState::Unpartitioned,
            poll_interval: Duration::from_millis(500),
            poll_attempts: 20,
        }
    }

    pub fn with_polling(mut self, interval: Duration, attempts: u32) -> Self {
        self.poll_interval = interval;
        self.poll_attempts = attempts.max(1);
        self
    }

    pub fn state(&self) -> DiskState {
        self.state
    }

    pub fn layout(&self) -> &DiskLayout {
        &self.layout
    }

    fn expect(&self, expected: DiskState, step: &'static str) -> Result<(), StageError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(StageError::precondition(
                step,
                vec![format!("state {:?} (currently {:?})", expected, self.state)],
            ))
        }
    }

    fn run(&self, cmd: Cmd) -> Result<()> {
        self.runner.run(&cmd).map(|_| ())
    }

    fn mkdir(&self, relative: &str) -> Result<()> {
        self.run(Cmd::new("mkdir").arg("-p").arg_path(&self.target.join(relative)))
    }

    /// Wipe, label GPT, create ESP + ROOT and wait for both nodes.
    pub fn partition(&mut self) -> Result<()> {
        self.expect(DiskState::Unpartitioned, "partition")?;
        let device = self.layout.device.clone();
        println!("=== Partitioning {} ===\n", device.display());

        self.run(
            Cmd::new("wipefs")
                .arg("-a")
                .arg_path(&device)
                .error_msg("wipefs failed. Is the disk still mounted?"),
        )?;
        self.run(Cmd::new("parted").arg("-s").arg_path(&device).args(["mklabel", "gpt"]))?;

        let (esp_start, esp_end) = self.layout.esp().parted_bounds();
        self.run(
            Cmd::new("parted")
                .arg("-s")
                .arg_path(&device)
                .args(["mkpart", "primary", "fat32", esp_start.as_str(), esp_end.as_str()]),
        )?;
        let (root_start, root_end) = self.layout.root().parted_bounds();
        let fs_name = self.layout.fs_kind.to_string();
        self.run(
            Cmd::new("parted")
                .arg("-s")
                .arg_path(&device)
                .args(["mkpart", "primary", fs_name.as_str(), root_start.as_str(), root_end.as_str()]),
        )?;
        self.run(Cmd::new("parted").arg("-s").arg_path(&device).args(["set", "1", "esp", "on"]))?;
        self.run(Cmd::new("partprobe").arg_path(&device))?;

        let nodes = [self.layout.esp().node.clone(), self.layout.root().node.clone()];
        self.wait_for_nodes(&nodes)?;
        self.state = DiskState::PartitionTablePresent;
        Ok(())
    }

    fn wait_for_nodes(&self, nodes: &[PathBuf]) -> Result<(), StageError> {
        for attempt in 1..=self.poll_attempts {
            if nodes.iter().all(|n| self.probe.exists(n)) {
                return Ok(());
            }
            if attempt < self.poll_attempts {
                std::thread::sleep(self.poll_interval);
            }
        }
        Err(StageError::ResourceNotReady {
            resource: nodes
                .iter()
                .map(|n| n.display().to_string())
                .collect::<Vec<_>>()
                .join(", "),
            attempts: self.poll_attempts,
        })
    }

    /// ESP first, then ROOT.
    pub fn format(&mut self) -> Result<()> {
        self.expect(DiskState::PartitionTablePresent, "format")?;
        let esp = self.layout.esp().node.clone();
        let root = self.layout.root().node.clone();
        self.wait_for_nodes(std::slice::from_ref(&esp))?;

        println!("=== Formatting ===\n");
        self.run(
            Cmd::new("mkfs.vfat")
                .arg("-F32")
                .arg_path(&esp)
                .error_msg("mkfs.vfat failed. Install dosfstools."),
        )?;
        let mkfs = match self.layout.fs_kind {
            FsKind::Btrfs => Cmd::new("mkfs.btrfs")
                .args(["-f", "-L", "ROOT"])
                .error_msg("mkfs.btrfs failed. Install btrfs-progs."),
            FsKind::Ext4 => Cmd::new("mkfs.ext4")
                .args(["-F", "-L", "ROOT"])
                .error_msg("mkfs.ext4 failed. Install e2fsprogs."),
        };
        self.run(mkfs.arg_path(&root))?;
        self.state = DiskState::Formatted;
        Ok(())
    }

    /// Mount ROOT at the target, laying out subvolumes first on btrfs.
    pub fn mount(&mut self, compression_level: u8) -> Result<()> {
        self.expect(DiskState::Formatted, "mount")?;
        let root = self.layout.root().node.clone();
        let target = self.target.clone();
        fs::create_dir_all(&target)
            .with_context(|| format!("creating target root '{}'", target.display()))?;

        match self.layout.fs_kind {
            FsKind::Ext4 => {
                self.run(Cmd::new("mount").arg_path(&root).arg_path(&target))?;
                self.state = DiskState::Mounted;
            }
            FsKind::Btrfs => {
                self.run(Cmd::new("mount").arg_path(&root).arg_path(&target))?;
                // Anything failing from here on must not leave ROOT mounted.
                self.state = DiskState::Mounted;
                self.create_subvolumes()?;
                self.run(Cmd::new("umount").arg_path(&target))?;
                self.mount_subvolumes(&root, compression_level)?;
            }
        }
        Ok(())
    }

    fn create_subvolumes(&self) -> Result<()> {
        println!("Creating btrfs subvolumes...");
        for subvol in &self.layout.subvolumes {
            if let Some((parent, _)) = subvol.name.rsplit_once('/') {
                self.mkdir(parent)?;
            }
            self.run(
                Cmd::new("btrfs")
                    .args(["subvolume", "create"])
                    .arg_path(&self.target.join(subvol.name))
                    .error_msg(format!("Failed to create subvolume {}", subvol.name)),
            )?;
        }
        Ok(())
    }

    fn mount_subvolumes(&self, root: &Path, level: u8) -> Result<()> {
        let options = |name: &str| {
            format!(
                "subvol={},compress=zstd:{},compress-force=zstd:{}",
                name, level, level
            )
        };
        let (top, rest) = match self.layout.subvolumes.split_first() {
            Some(split) => split,
            None => return Ok(()),
        };
        self.run(
            Cmd::new("mount")
                .args(["-o", options(top.name).as_str()])
                .arg_path(root)
                .arg_path(&self.target),
        )?;
        for subvol in rest {
            self.mkdir(subvol.mount_at)?;
        }
        self.mkdir("boot/efi")?;
        for subvol in rest {
            self.run(
                Cmd::new("mount")
                    .args(["-o", options(subvol.name).as_str()])
                    .arg_path(root)
                    .arg_path(&self.target.join(subvol.mount_at)),
            )?;
        }
        Ok(())
    }

    /// ESP, base system, payloads, bind mounts and fstab.
    pub fn populate(&mut self, plan: &ProvisionPlan, profile: &DistroProfile) -> Result<()> {
        self.expect(DiskState::Mounted, "populate")?;
        let target = self.target.clone();

        self.mkdir("boot/efi")?;
        self.run(
            Cmd::new("mount")
                .arg_path(&self.layout.esp().node)
                .arg_path(&target.join("boot/efi")),
        )?;

        println!("=== Installing base system ===\n");
        match profile.base_install {
            BaseInstall::Pacstrap => self.run(
                Cmd::new("pacstrap")
                    .arg_path(&target)
                    .args(&plan.packages)
                    .error_msg("pacstrap failed. Install arch-install-scripts."),
            )?,
            BaseInstall::CloneLive => {
                let rules = ExcludeRules::system(Path::new("/"), &target);
                clone::clone(self.runner, Path::new("/"), &target, &rules)?;
            }
        }

        for payload in &plan.payloads {
            self.stage_payload(payload)?;
        }

        for bind in BIND_MOUNTS {
            self.mkdir(bind)?;
            self.run(
                Cmd::new("mount")
                    .arg("--bind")
                    .arg(format!("/{}", bind))
                    .arg_path(&target.join(bind)),
            )?;
        }

        let fstab = self
            .runner
            .capture(&Cmd::new("genfstab").arg("-U").arg_path(&target))?
            .stdout;
        let fstab_path = target.join("etc/fstab");
        if let Some(parent) = fstab_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating '{}'", parent.display()))?;
        }
        fs::write(&fstab_path, fstab)
            .with_context(|| format!("writing '{}'", fstab_path.display()))?;

        self.state = DiskState::Populated;
        Ok(())
    }

    fn stage_payload(&self, payload: &plan::Payload) -> Result<()> {
        let dest = self.target.join(&payload.dest);
        println!("Downloading {}...", payload.url);
        if payload.unsquash {
            let archive = self.target.join(".payload.sfs");
            self.run(
                Cmd::new("curl")
                    .args(["-L", "--fail", "-o"])
                    .arg_path(&archive)
                    .arg(&payload.url)
                    .error_msg(format!("Download failed: {}", payload.url)),
            )?;
            self.run(
                Cmd::new("unsquashfs")
                    .arg("-f")
                    .arg("-d")
                    .arg_path(&dest)
                    .arg_path(&archive)
                    .error_msg("unsquashfs failed. Install squashfs-tools."),
            )?;
            self.run(Cmd::new("rm").arg("-f").arg_path(&archive).allow_fail())
        } else {
            if let Some(parent) = Path::new(&payload.dest).parent() {
                if !parent.as_os_str().is_empty() {
                    self.mkdir(&parent.display().to_string())?;
                }
            }
            self.run(
                Cmd::new("curl")
                    .args(["-L", "--fail", "-o"])
                    .arg_path(&dest)
                    .arg(&payload.url)
                    .error_msg(format!("Download failed: {}", payload.url)),
            )
        }
    }

    /// Bootloader, accounts, services and initramfs inside the chroot.
    pub fn provision(&mut self, plan: &ProvisionPlan, profile: &DistroProfile) -> Result<()> {
        self.expect(DiskState::Populated, "provision")?;
        println!("=== Configuring installed system ===\n");
        chroot::configure(self.runner, &self.target, plan, profile)?;
        self.state = DiskState::Provisioned;
        Ok(())
    }

    /// `umount -R` the target.
    pub fn teardown(&mut self) -> Result<()> {
        if !self.state.is_mounted() {
            return Err(StageError::precondition(
                "teardown",
                vec![format!("a mounted target (currently {:?})", self.state)],
            )
            .into());
        }
        self.run(Cmd::new("umount").arg("-R").arg_path(&self.target))?;
        self.state = DiskState::TornDown;
        Ok(())
    }

    /// Every step in order. On failure after mounting, the target is
    /// unmounted with allow-failure and the original error returned.
    pub fn run_all(&mut self, plan: &ProvisionPlan, profile: &DistroProfile) -> Result<()> {
        let result = self.run_steps(plan, profile);
        if let Err(err) = result {
            if self.state.is_mounted() {
                warn!(state = ?self.state, "installation failed, unmounting target");
                let umount = Cmd::new("umount").arg("-R").arg_path(&self.target).allow_fail();
                if let Err(cleanup) = self.runner.run(&umount) {
                    warn!(target = %self.target.display(), error = %cleanup, "could not unmount target");
                }
                self.state = DiskState::TornDown;
            }
            return Err(err);
        }
        info!(device = %self.layout.device.display(), "installation complete");
        Ok(())
    }

    fn run_steps(&mut self, plan: &ProvisionPlan, profile: &DistroProfile) -> Result<()> {
        self.partition()?;
        self.format()?;
        self.mount(plan.compression_level)?;
        self.populate(plan, profile)?;
        self.provision(plan, profile)?;
        self.teardown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::stage_error;
    use crate::process::testing::RecordingRunner;
    use std::collections::HashSet;
    use tempfile::TempDir;

    const GIB: u64 = 1024 * 1024 * 1024;

    /// Reports only the nodes it was given.
    struct FakeProbe(HashSet<PathBuf>);

    impl FakeProbe {
        fn with(nodes: &[&str]) -> Self {
            Self(nodes.iter().map(PathBuf::from).collect())
        }
    }

    impl NodeProbe for FakeProbe {
        fn exists(&self, node: &Path) -> bool {
            self.0.contains(node)
        }
    }

    fn plan() -> ProvisionPlan {
        ProvisionPlan {
            username: Some("demo".into()),
            set_passwords: false,
            ..ProvisionPlan::defaults(&DistroProfile::arch())
        }
    }

    fn provisioner<'a>(
        runner: &'a RecordingRunner,
        probe: &'a FakeProbe,
        fs_kind: FsKind,
        target: &Path,
    ) -> DiskProvisioner<'a> {
        let layout = DiskLayout::plan(Path::new("/dev/sda"), 20 * GIB, fs_kind).unwrap();
        DiskProvisioner::new(runner, probe, layout, target)
            .with_polling(Duration::from_millis(1), 3)
    }

    #[test]
    fn out_of_order_step_spawns_nothing() {
        let tmp = TempDir::new().unwrap();
        let runner = RecordingRunner::new();
        let probe = FakeProbe::with(&["/dev/sda1", "/dev/sda2"]);
        let mut disk = provisioner(&runner, &probe, FsKind::Ext4, tmp.path());

        let err = disk.format().unwrap_err();
        assert!(matches!(
            stage_error(&err),
            Some(StageError::PreconditionNotMet { stage: "format", .. })
        ));
        assert!(runner.calls().is_empty());
        assert_eq!(disk.state(), DiskState::Unpartitioned);
    }

    #[test]
    fn missing_esp_node_blocks_formatting() {
        let tmp = TempDir::new().unwrap();
        let runner = RecordingRunner::new();
        let probe = FakeProbe::with(&["/dev/sda2"]);
        let mut disk = provisioner(&runner, &probe, FsKind::Ext4, tmp.path());

        let err = disk.run_all(&plan(), &DistroProfile::arch()).unwrap_err();

        assert!(matches!(
            stage_error(&err),
            Some(StageError::ResourceNotReady { attempts: 3, .. })
        ));
        assert!(runner.position("mkfs").is_none());
        assert_eq!(disk.state(), DiskState::Unpartitioned);
    }

    #[test]
    fn partition_commands_in_order() {
        let tmp = TempDir::new().unwrap();
        let runner = RecordingRunner::new();
        let probe = FakeProbe::with(&["/dev/sda1", "/dev/sda2"]);
        let mut disk = provisioner(&runner, &probe, FsKind::Btrfs, tmp.path());

        disk.partition().unwrap();

        assert_eq!(
            runner.calls(),
            vec![
                "wipefs -a /dev/sda",
                "parted -s /dev/sda mklabel gpt",
                "parted -s /dev/sda mkpart primary fat32 1MiB 551MiB",
                "parted -s /dev/sda mkpart primary btrfs 551MiB 100%",
                "parted -s /dev/sda set 1 esp on",
                "partprobe /dev/sda",
            ]
        );
        assert_eq!(disk.state(), DiskState::PartitionTablePresent);
    }

    #[test]
    fn esp_is_formatted_before_root() {
        let tmp = TempDir::new().unwrap();
        let runner = RecordingRunner::new();
        let probe = FakeProbe::with(&["/dev/sda1", "/dev/sda2"]);
        let mut disk = provisioner(&runner, &probe, FsKind::Ext4, tmp.path());

        disk.partition().unwrap();
        disk.format().unwrap();

        let esp = runner.position("mkfs.vfat -F32 /dev/sda1").unwrap();
        let root = runner.position("mkfs.ext4 -F -L ROOT /dev/sda2").unwrap();
        assert!(esp < root);
    }

    #[test]
    fn subvolumes_exist_before_anything_mounts_on_them() {
        let tmp = TempDir::new().unwrap();
        let runner = RecordingRunner::new();
        let probe = FakeProbe::with(&["/dev/sda1", "/dev/sda2"]);
        let mut disk = provisioner(&runner, &probe, FsKind::Btrfs, tmp.path());

        disk.partition().unwrap();
        disk.format().unwrap();
        disk.mount(22).unwrap();

        let last_create = runner
            .calls()
            .iter()
            .rposition(|c| c.starts_with("btrfs subvolume create"))
            .unwrap();
        let first_subvol_mount = runner.position("mount -o subvol=@,").unwrap();
        assert!(last_create < first_subvol_mount);
        assert!(runner
            .calls()
            .iter()
            .any(|c| c.starts_with("mount -o subvol=@home,compress=zstd:22,compress-force=zstd:22")));
        assert!(runner.calls().iter().any(|c| c.ends_with("var/lib/machines")
            && c.starts_with("mount -o subvol=@/var/lib/machines")));
        assert_eq!(disk.state(), DiskState::Mounted);
    }

    #[test]
    fn full_install_sequence() {
        let tmp = TempDir::new().unwrap();
        let runner = RecordingRunner::new();
        runner.respond("genfstab", "UUID=abcd / ext4 rw 0 1\n");
        let probe = FakeProbe::with(&["/dev/sda1", "/dev/sda2"]);
        let mut disk = provisioner(&runner, &probe, FsKind::Ext4, tmp.path());

        disk.run_all(&plan(), &DistroProfile::arch()).unwrap();

        assert_eq!(disk.state(), DiskState::TornDown);
        assert_eq!(
            fs::read_to_string(tmp.path().join("etc/fstab")).unwrap(),
            "UUID=abcd / ext4 rw 0 1\n"
        );
        assert_eq!(
            fs::read_to_string(tmp.path().join("etc/modprobe.d/disable-ntfs3.conf")).unwrap(),
            "blacklist ntfs3\n"
        );
        let order = [
            "pacstrap",
            "mount --bind /dev ",
            "genfstab",
            "chroot",
            "umount -R",
        ]
        .map(|p| runner.position(p).unwrap());
        assert!(order.windows(2).all(|w| w[0] < w[1]), "{:?}", runner.calls());
        assert!(runner.calls().iter().any(|c| c.contains("grub-install --target=x86_64-efi")));
        assert!(runner.calls().iter().any(|c| c.ends_with("mkinitcpio -P")));
        assert!(!runner.calls().iter().any(|c| c.contains("passwd")));
    }

    #[test]
    fn clone_install_on_ubuntu() {
        let tmp = TempDir::new().unwrap();
        let runner = RecordingRunner::new();
        runner.respond("genfstab", "UUID=abcd / btrfs rw 0 0\n");
        let probe = FakeProbe::with(&["/dev/sda1", "/dev/sda2"]);
        let mut disk = provisioner(&runner, &probe, FsKind::Btrfs, tmp.path());
        let profile = DistroProfile::ubuntu();
        let plan = ProvisionPlan {
            username: Some("demo".into()),
            set_passwords: false,
            ..ProvisionPlan::defaults(&profile)
        };

        disk.run_all(&plan, &profile).unwrap();

        assert_eq!(disk.state(), DiskState::TornDown);
        let calls = runner.calls();
        assert!(runner.position("pacstrap").is_none());
        let rsync = runner.position("rsync -aHAXSr").unwrap();
        assert!(calls[rsync].ends_with(&format!("/ {}/", tmp.path().display())));
        assert!(calls.iter().any(|c| c.ends_with("useradd -m -G sudo -s /bin/bash demo")));
        assert!(!calls.iter().any(|c| c.contains("wheel")));
        assert!(calls.iter().any(|c| c.contains("systemctl enable gdm3.service NetworkManager.service")));
        assert!(calls.iter().any(|c| c.ends_with("update-initramfs -u -k all")));
        assert_eq!(
            fs::read_to_string(tmp.path().join("etc/sudoers.d/10-sudo")).unwrap(),
            "%sudo ALL=(ALL:ALL) ALL\n"
        );
        let order = ["mount -o subvol=@,", "rsync", "genfstab", "chroot", "umount -R"]
            .map(|p| runner.position(p).unwrap());
        assert!(order.windows(2).all(|w| w[0] < w[1]), "{:?}", calls);
    }

    #[test]
    fn failure_after_mount_unmounts_and_keeps_original_error() {
        let tmp = TempDir::new().unwrap();
        let runner = RecordingRunner::new();
        runner.fail_on("pacstrap");
        runner.fail_on("umount -R");
        let probe = FakeProbe::with(&["/dev/sda1", "/dev/sda2"]);
        let mut disk = provisioner(&runner, &probe, FsKind::Ext4, tmp.path());

        let err = disk.run_all(&plan(), &DistroProfile::arch()).unwrap_err();

        match stage_error(&err) {
            Some(StageError::ExternalProcessFailed { command, .. }) => {
                assert!(command.starts_with("pacstrap"))
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(runner.position("umount -R").is_some());
        assert_eq!(disk.state(), DiskState::TornDown);
    }

    #[test]
    fn unsquashed_payload_is_downloaded_then_removed() {
        let tmp = TempDir::new().unwrap();
        let runner = RecordingRunner::new();
        let probe = FakeProbe::with(&["/dev/sda1", "/dev/sda2"]);
        let mut disk = provisioner(&runner, &probe, FsKind::Ext4, tmp.path());
        let mut plan = plan();
        plan.payloads.push(plan::Payload {
            url: "https://example.org/home.sfs".into(),
            dest: "home".into(),
            unsquash: true,
        });

        disk.partition().unwrap();
        disk.format().unwrap();
        disk.mount(22).unwrap();
        disk.populate(&plan, &DistroProfile::arch()).unwrap();

        let curl = runner.position("curl -L --fail -o").unwrap();
        let unsquash = runner.position("unsquashfs -f -d").unwrap();
        let rm = runner.position("rm -f").unwrap();
        assert!(curl < unsquash && unsquash < rm);
    }
}
