//! Whole-filesystem block images.
//!
//! An alternative to a plain squashfs: the staging tree is laid into a
//! preallocated btrfs or ext4 image. Btrfs images are populated at format
//! time with `--rootdir` and compressed by the filesystem itself. Ext4
//! images are populated through a loop mount and then squashed.

use anyhow::{Context, Result};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::StageError;
use crate::process::{Cmd, Runner};

/// Final image name in the output directory.
pub const IMAGE_NAME: &str = "rootfs.img";

/// Uncompressed ext4 image, removed once squashed.
pub const RAW_IMAGE_NAME: &str = "rootfs1.img";

/// Loop mount point used while populating an ext4 image.
pub const IMAGE_MOUNT_POINT: &str = "/mnt/live-builder-image";

const EXT4_MOUNT_OPTIONS: &str =
    "loop,discard,noatime,data=writeback,commit=60,barrier=0,nobh,errors=remount-ro";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsKind {
    Btrfs,
    Ext4,
}

impl FromStr for FsKind {
    type Err = StageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "btrfs" => Ok(FsKind::Btrfs),
            "ext4" => Ok(FsKind::Ext4),
            other => Err(StageError::invalid_input(
                "filesystem",
                format!("expected btrfs or ext4, got '{}'", other),
            )),
        }
    }
}

impl fmt::Display for FsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FsKind::Btrfs => "btrfs",
            FsKind::Ext4 => "ext4",
        })
    }
}

/// Build `<output_dir>/rootfs.img` of `size_bytes` from `staging`.
///
/// Returns the path of the finished image.
pub fn package_block_image(
    runner: &dyn Runner,
    output_dir: &Path,
    size_bytes: u64,
    fs_kind: FsKind,
    staging: Option<&Path>,
    mount_point: &Path,
) -> Result<PathBuf> {
    if size_bytes == 0 {
        return Err(StageError::invalid_input("size", "image size must be greater than zero").into());
    }
    fs::create_dir_all(output_dir)
        .with_context(|| format!("creating output directory '{}'", output_dir.display()))?;

    let image = output_dir.join(IMAGE_NAME);
    match fs_kind {
        FsKind::Btrfs => {
            preallocate(runner, &image, size_bytes)?;
            println!("Creating btrfs filesystem with zstd compression...");
            let mut mkfs = Cmd::new("mkfs.btrfs")
                .args(["-L", "LIVE_SYSTEM", "--compress=zstd"]);
            if let Some(staging) = staging {
                mkfs = mkfs.arg(format!("--rootdir={}", staging.display()));
            }
            runner.run(
                &mkfs
                    .arg("-f")
                    .arg_path(&image)
                    .error_msg("mkfs.btrfs failed. Install btrfs-progs (5.14+ for --compress)."),
            )?;
        }
        FsKind::Ext4 => {
            let raw = output_dir.join(RAW_IMAGE_NAME);
            preallocate(runner, &raw, size_bytes)?;
            println!("Formatting as ext4...");
            runner.run(
                &Cmd::new("mkfs.ext4")
                    .args(["-F", "-O", "^has_journal,^resize_inode"])
                    .args(["-E", "lazy_itable_init=0", "-m", "0", "-L", "SYSTEM_BACKUP"])
                    .arg_path(&raw)
                    .error_msg("mkfs.ext4 failed. Install e2fsprogs."),
            )?;
            if let Some(staging) = staging {
                populate_ext4(runner, &raw, staging, mount_point)?;
            }
            println!("Creating squashfs from ext4 image...");
            runner.run(
                &Cmd::new("mksquashfs")
                    .arg_path(&raw)
                    .arg_path(&image)
                    .args(["-noappend", "-comp", "xz", "-Xbcj", "x86", "-b", "1M"])
                    .error_msg("mksquashfs failed. Install squashfs-tools."),
            )?;
            runner.run(&Cmd::new("rm").arg("-f").arg_path(&raw).allow_fail())?;
        }
    }

    println!("Image created: {}", image.display());
    Ok(image)
}

fn preallocate(runner: &dyn Runner, path: &Path, size_bytes: u64) -> Result<()> {
    println!("Allocating {} MB for {}...", size_bytes / 1024 / 1024, path.display());
    runner.run(
        &Cmd::new("fallocate")
            .arg("-l")
            .arg(size_bytes.to_string())
            .arg_path(path)
            .error_msg("fallocate failed. Check free space in the output directory."),
    )?;
    Ok(())
}

fn populate_ext4(runner: &dyn Runner, image: &Path, staging: &Path, mount_point: &Path) -> Result<()> {
    fs::create_dir_all(mount_point)
        .with_context(|| format!("creating mount point '{}'", mount_point.display()))?;
    runner.run(
        &Cmd::new("mount")
            .args(["-o", EXT4_MOUNT_OPTIONS])
            .arg_path(image)
            .arg_path(mount_point)
            .error_msg("Loop mount failed. Is the loop module loaded?"),
    )?;

    println!("Copying staging tree into image...");
    let copied = runner.run(
        &Cmd::new("rsync")
            .args(["-aHAXSr", "--numeric-ids", "--info=progress2"])
            .arg(format!("{}/", staging.display()))
            .arg(format!("{}/", mount_point.display()))
            .tolerate_codes(&[23, 24])
            .error_msg("rsync into the image failed. Is the image large enough?"),
    );

    runner.run(&Cmd::new("umount").arg_path(mount_point).allow_fail())?;
    runner.run(&Cmd::new("rmdir").arg_path(mount_point).allow_fail())?;
    copied.map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::stage_error;
    use crate::process::testing::RecordingRunner;
    use tempfile::TempDir;

    #[test]
    fn zero_size_is_rejected_before_spawning() {
        let tmp = TempDir::new().unwrap();
        let runner = RecordingRunner::new();
        let err = package_block_image(
            &runner,
            tmp.path(),
            0,
            FsKind::Btrfs,
            None,
            &tmp.path().join("mnt"),
        )
        .unwrap_err();
        assert!(matches!(
            stage_error(&err),
            Some(StageError::UserInputInvalid { field: "size", .. })
        ));
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn btrfs_is_populated_at_format_time() {
        let tmp = TempDir::new().unwrap();
        let runner = RecordingRunner::new();
        let staging = tmp.path().join("staging");
        let image = package_block_image(
            &runner,
            tmp.path(),
            1 << 30,
            FsKind::Btrfs,
            Some(&staging),
            &tmp.path().join("mnt"),
        )
        .unwrap();

        let calls = runner.calls();
        assert_eq!(image, tmp.path().join(IMAGE_NAME));
        assert!(calls[0].starts_with("fallocate -l 1073741824"));
        assert!(calls[1].starts_with("mkfs.btrfs -L LIVE_SYSTEM --compress=zstd --rootdir="));
        assert_eq!(calls.len(), 2);
    }

    #[test]
    fn ext4_mounts_copies_unmounts_then_squashes() {
        let tmp = TempDir::new().unwrap();
        let runner = RecordingRunner::new();
        let staging = tmp.path().join("staging");
        let mnt = tmp.path().join("mnt");
        package_block_image(&runner, tmp.path(), 1 << 30, FsKind::Ext4, Some(&staging), &mnt)
            .unwrap();

        let order: Vec<_> = ["fallocate", "mkfs.ext4", "mount", "rsync", "umount", "mksquashfs", "rm"]
            .iter()
            .map(|p| runner.position(&format!("{} ", p)).unwrap())
            .collect();
        assert!(order.windows(2).all(|w| w[0] < w[1]), "{:?}", runner.calls());
        assert!(runner.calls()[1].contains("^has_journal,^resize_inode"));
    }

    #[test]
    fn failed_copy_still_unmounts() {
        let tmp = TempDir::new().unwrap();
        let runner = RecordingRunner::new();
        runner.fail_on("rsync");
        let result = package_block_image(
            &runner,
            tmp.path(),
            1 << 30,
            FsKind::Ext4,
            Some(&tmp.path().join("staging")),
            &tmp.path().join("mnt"),
        );
        assert!(result.is_err());
        assert!(runner.position("umount ").is_some());
        assert!(runner.position("mksquashfs ").is_none());
    }

    #[test]
    fn fs_kind_parses() {
        assert_eq!("BTRFS".parse::<FsKind>().unwrap(), FsKind::Btrfs);
        assert!("xfs".parse::<FsKind>().is_err());
    }
}
