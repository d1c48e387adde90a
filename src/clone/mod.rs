//! Replicating a filesystem into a staging tree.
//!
//! The staging tree mirrors what ends up inside the live image. It is filled
//! by `rsync` under a fixed exclusion policy: the contents of virtual and
//! transient mounts are skipped but their directories are still created, so
//! the booted image has somewhere to mount them.
//!
//! Re-running a clone into the same staging tree converges (`--delete`).

mod rules;

pub use rules::ExcludeRules;

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::process::{Cmd, Runner};

/// Name of the staging directory created under `cloneDir`.
pub const STAGING_DIR_NAME: &str = "clone_system_temp";

/// Where another drive is mounted while it is cloned.
pub const TEMP_MOUNT_POINT: &str = "/mnt/temp_clone_mount";

/// rsync exit codes for partial transfer and vanished source files.
const RSYNC_TOLERATED: &[i32] = &[23, 24];

/// No `-x`: `/home`, `/var/log` and friends are often separate btrfs
/// subvolume mounts and must be copied. Virtual filesystems are kept out by
/// the exclude rules instead.
const RSYNC_BASE_ARGS: &[&str] = &["-aHAXSr", "--numeric-ids", "--info=progress2"];

/// `<clone_dir>/clone_system_temp`
pub fn staging_dir(clone_dir: &Path) -> PathBuf {
    clone_dir.join(STAGING_DIR_NAME)
}

/// Mirror `source_root` into `dest_dir`.
pub fn clone(
    runner: &dyn Runner,
    source_root: &Path,
    dest_dir: &Path,
    rules: &ExcludeRules,
) -> Result<()> {
    if !source_root.is_dir() {
        bail!("Clone source is not a directory: {}", source_root.display());
    }
    fs::create_dir_all(dest_dir)
        .with_context(|| format!("creating staging tree '{}'", dest_dir.display()))?;

    println!(
        "Cloning {} -> {}",
        source_root.display(),
        dest_dir.display()
    );
    runner.run(&rsync_cmd(source_root, dest_dir, rules))?;
    report_summary(dest_dir);
    Ok(())
}

/// Clone with `/usr` copied in its own pass.
///
/// Keeps the first pass short on systems with a very large `/usr`.
pub fn clone_two_phase(
    runner: &dyn Runner,
    source_root: &Path,
    dest_dir: &Path,
    rules: &ExcludeRules,
) -> Result<()> {
    if !source_root.is_dir() {
        bail!("Clone source is not a directory: {}", source_root.display());
    }
    fs::create_dir_all(dest_dir)
        .with_context(|| format!("creating staging tree '{}'", dest_dir.display()))?;

    println!("Cloning part 1 of 2 (everything except /usr)...");
    let first = rules.clone().with_pattern("/usr/*");
    runner.run(&rsync_cmd(source_root, dest_dir, &first))?;

    println!("Cloning part 2 of 2 (/usr)...");
    let usr_src = source_root.join("usr");
    if usr_src.is_dir() {
        let usr_dest = dest_dir.join("usr");
        runner.run(&rsync_cmd(&usr_src, &usr_dest, &ExcludeRules::none()))?;
    } else {
        warn!(path = %usr_src.display(), "source has no /usr, skipping second pass");
    }
    report_summary(dest_dir);
    Ok(())
}

/// The host mount table, in `/proc/mounts` format.
pub fn read_mount_table() -> Result<String> {
    fs::read_to_string("/proc/mounts").context("reading /proc/mounts")
}

/// Clone a block device, mounting it at `mount_point` if `mounts` shows it
/// is not mounted yet.
///
/// The temporary mount is always released, also when the copy fails.
pub fn clone_device(
    runner: &dyn Runner,
    device: &Path,
    mount_point: &Path,
    mounts: &str,
    dest_dir: &Path,
    rules: &ExcludeRules,
) -> Result<()> {
    if !device.exists() {
        bail!("Drive {} does not exist", device.display());
    }

    if let Some(existing) = mount_point_of(mounts, device) {
        info!(device = %device.display(), mount = %existing.display(), "drive already mounted");
        return clone(runner, &existing, dest_dir, rules);
    }

    fs::create_dir_all(mount_point)
        .with_context(|| format!("creating mount point '{}'", mount_point.display()))?;
    runner.run(
        &Cmd::new("mount")
            .arg_path(device)
            .arg_path(mount_point)
            .error_msg(format!("Failed to mount {}", device.display())),
    )?;

    let result = clone(runner, mount_point, dest_dir, rules);

    runner.run(&Cmd::new("umount").arg_path(mount_point).allow_fail())?;
    runner.run(&Cmd::new("rmdir").arg_path(mount_point).allow_fail())?;
    result
}

/// Copy one folder or file into `<clone_dir>/home/userfiles`.
pub fn clone_path(runner: &dyn Runner, source: &Path, clone_dir: &Path) -> Result<PathBuf> {
    if !source.exists() {
        bail!("Source path does not exist: {}", source.display());
    }
    let userfiles = clone_dir.join("home/userfiles");
    fs::create_dir_all(&userfiles)
        .with_context(|| format!("creating '{}'", userfiles.display()))?;

    println!("Cloning {} -> {}", source.display(), userfiles.display());
    runner.run(
        &Cmd::new("rsync")
            .args(["-aHAXSr", "--numeric-ids", "--info=progress2"])
            .arg_path(source)
            .arg(format!("{}/", userfiles.display()))
            .tolerate_codes(RSYNC_TOLERATED)
            .error_msg("rsync failed. Install rsync."),
    )?;
    Ok(userfiles)
}

/// Remove a staging tree and the image built from it. Failures only warn.
pub fn delete_staging(runner: &dyn Runner, staging: &Path, image: Option<&Path>) -> Result<()> {
    println!("Deleting {}", staging.display());
    runner.run(&Cmd::new("rm").arg("-rf").arg_path(staging).allow_fail())?;
    if let Some(image) = image.filter(|p| p.exists()) {
        println!("Deleting {}", image.display());
        runner.run(&Cmd::new("rm").arg("-f").arg_path(image).allow_fail())?;
    }
    Ok(())
}

fn rsync_cmd(source_root: &Path, dest_dir: &Path, rules: &ExcludeRules) -> Cmd {
    Cmd::new("rsync")
        .args(RSYNC_BASE_ARGS)
        .arg("--delete")
        .args(rules.rsync_args())
        .arg(with_trailing_slash(source_root))
        .arg(with_trailing_slash(dest_dir))
        .tolerate_codes(RSYNC_TOLERATED)
        .error_msg("rsync failed. Install rsync: pacman -S rsync / apt-get install rsync")
}

fn with_trailing_slash(path: &Path) -> String {
    let text = path.display().to_string();
    if text.ends_with('/') {
        text
    } else {
        format!("{}/", text)
    }
}

/// Mount point of `device` in `/proc/mounts` formatted text.
pub fn mount_point_of(mounts: &str, device: &Path) -> Option<PathBuf> {
    let device = device.to_str()?;
    mounts.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        let source = fields.next()?;
        let target = fields.next()?;
        (source == device).then(|| PathBuf::from(target.replace("\\040", " ")))
    })
}

/// File count and total bytes of a tree.
pub fn tree_summary(root: &Path) -> (u64, u64) {
    WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .fold((0, 0), |(files, bytes), entry| {
            let len = entry.metadata().map(|m| m.len()).unwrap_or(0);
            (files + 1, bytes + len)
        })
}

fn report_summary(dest_dir: &Path) {
    let (files, bytes) = tree_summary(dest_dir);
    println!(
        "  Staged {} files ({} MB) in {}",
        files,
        bytes / 1024 / 1024,
        dest_dir.display()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::testing::RecordingRunner;
    use crate::process::SystemRunner;
    use tempfile::TempDir;

    fn sample_source(root: &Path) {
        fs::create_dir_all(root.join("proc")).unwrap();
        fs::write(root.join("proc/1"), "pid").unwrap();
        fs::create_dir_all(root.join("home/user")).unwrap();
        fs::write(root.join("home/user/file.txt"), "hello").unwrap();
        fs::create_dir_all(root.join("etc")).unwrap();
        fs::write(root.join("etc/fstab"), "UUID=x / ext4 defaults 0 1\n").unwrap();
    }

    #[test]
    #[ignore = "needs rsync on the host"]
    fn virtual_mount_contents_excluded_directories_kept() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        let dest = tmp.path().join("dest");
        sample_source(&src);

        let rules = ExcludeRules::system(&src, &dest);
        clone(&SystemRunner, &src, &dest, &rules).unwrap();

        assert_eq!(
            fs::read_to_string(dest.join("home/user/file.txt")).unwrap(),
            "hello"
        );
        assert!(dest.join("proc").is_dir());
        assert!(!dest.join("proc/1").exists());
        assert!(!dest.join("etc/fstab").exists());
    }

    #[test]
    #[ignore = "needs rsync on the host"]
    fn clone_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        let dest = tmp.path().join("dest");
        sample_source(&src);
        let rules = ExcludeRules::system(&src, &dest);

        clone(&SystemRunner, &src, &dest, &rules).unwrap();
        let first = tree_summary(&dest);
        clone(&SystemRunner, &src, &dest, &rules).unwrap();
        assert_eq!(tree_summary(&dest), first);

        fs::remove_file(src.join("home/user/file.txt")).unwrap();
        clone(&SystemRunner, &src, &dest, &rules).unwrap();
        assert!(!dest.join("home/user/file.txt").exists());
    }

    #[test]
    fn rsync_invocation_shape() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        fs::create_dir_all(&src).unwrap();
        let dest = tmp.path().join("dest");
        let runner = RecordingRunner::new();

        clone(&runner, &src, &dest, &ExcludeRules::system(&src, &dest)).unwrap();

        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        let call = &calls[0];
        assert!(call.starts_with("rsync -aHAXSr --numeric-ids --info=progress2 --delete"));
        assert!(!call.split(' ').any(|arg| arg == "-x" || arg == "--one-file-system"));
        assert!(call.contains("--exclude=/proc/*"));
        assert!(call.contains("--exclude=/etc/fstab"));
        assert!(call.ends_with(&format!("{}/ {}/", src.display(), dest.display())));
    }

    #[test]
    fn two_phase_copies_usr_separately() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        fs::create_dir_all(src.join("usr/bin")).unwrap();
        let dest = tmp.path().join("dest");
        let runner = RecordingRunner::new();

        clone_two_phase(&runner, &src, &dest, &ExcludeRules::system(&src, &dest)).unwrap();

        let calls = runner.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].contains("--exclude=/usr/*"));
        assert!(calls[1].ends_with(&format!(
            "{}/ {}/",
            src.join("usr").display(),
            dest.join("usr").display()
        )));
    }

    #[test]
    fn finds_existing_mount_point() {
        let mounts = "/dev/sda2 /run/media/demo/My\\040Disk ext4 rw 0 0\n\
                      proc /proc proc rw 0 0\n";
        assert_eq!(
            mount_point_of(mounts, Path::new("/dev/sda2")),
            Some(PathBuf::from("/run/media/demo/My Disk"))
        );
        assert_eq!(mount_point_of(mounts, Path::new("/dev/sdb1")), None);
    }

    #[test]
    fn device_is_unmounted_when_copy_fails() {
        let tmp = TempDir::new().unwrap();
        let device = tmp.path().join("sdb1");
        fs::write(&device, "").unwrap();
        let mount_point = tmp.path().join("mnt");
        let dest = tmp.path().join("dest");
        let runner = RecordingRunner::new();
        runner.fail_on("rsync");

        let err = clone_device(
            &runner,
            &device,
            &mount_point,
            "proc /proc proc rw 0 0\n",
            &dest,
            &ExcludeRules::none(),
        );

        assert!(err.is_err());
        let mount = runner.position("mount ").unwrap();
        let rsync = runner.position("rsync").unwrap();
        let umount = runner.position("umount").unwrap();
        assert!(mount < rsync && rsync < umount);
        assert!(runner.position("rmdir").unwrap() > umount);
    }

    #[test]
    fn mounted_device_is_cloned_in_place() {
        let tmp = TempDir::new().unwrap();
        let device = tmp.path().join("sdb1");
        fs::write(&device, "").unwrap();
        let existing = tmp.path().join("media");
        fs::create_dir_all(&existing).unwrap();
        let mounts = format!("{} {} ext4 rw 0 0\n", device.display(), existing.display());
        let runner = RecordingRunner::new();

        clone_device(
            &runner,
            &device,
            &tmp.path().join("mnt"),
            &mounts,
            &tmp.path().join("dest"),
            &ExcludeRules::none(),
        )
        .unwrap();

        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].starts_with("rsync"));
        assert!(calls[0].contains(&format!("{}/", existing.display())));
    }

    #[test]
    fn clone_path_lands_in_userfiles() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("notes.txt");
        fs::write(&file, "x").unwrap();
        let clone_dir = tmp.path().join("clone");
        let runner = RecordingRunner::new();

        let userfiles = clone_path(&runner, &file, &clone_dir).unwrap();
        assert_eq!(userfiles, clone_dir.join("home/userfiles"));
        assert!(userfiles.is_dir());
        assert!(runner.calls()[0].ends_with(&format!("{}/", userfiles.display())));
    }

    #[test]
    fn delete_staging_tolerates_failure() {
        let runner = RecordingRunner::new();
        runner.fail_on("rm");
        delete_staging(&runner, Path::new("/nonexistent/clone_system_temp"), None).unwrap();
        assert_eq!(runner.calls().len(), 1);
    }
}
