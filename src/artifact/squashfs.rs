//! Squashfs image builder.
//!
//! Wraps `mksquashfs` to turn a staging tree into the compressed root
//! filesystem the live ISO boots from.
//!
//! # Example
//!
//! ```rust,ignore
//! use live_builder::artifact::squashfs::{package_directory, Codec};
//! use live_builder::clone::ExcludeRules;
//! use live_builder::process::SystemRunner;
//! use std::path::Path;
//!
//! package_directory(
//!     &SystemRunner,
//!     Path::new("/home/demo/clone/clone_system_temp"),
//!     Path::new("/home/demo/.config/live-builder/build-image-arch/arch/x86_64/airootfs.sfs"),
//!     Codec::Xz,
//!     &ExcludeRules::none(),
//! )?;
//! ```

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::clone::ExcludeRules;
use crate::process::{Cmd, Runner};

/// Compression settings for the root filesystem.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Codec {
    /// xz with the x86 BCJ filter. Smallest images.
    #[default]
    Xz,
    /// zstd at the given level (1-22). Faster to build and boot.
    Zstd { level: u8 },
}

impl Codec {
    fn args(self) -> Vec<String> {
        match self {
            Codec::Xz => vec!["-comp".into(), "xz".into(), "-Xbcj".into(), "x86".into()],
            Codec::Zstd { level } => vec![
                "-comp".into(),
                "zstd".into(),
                "-Xcompression-level".into(),
                level.clamp(1, 22).to_string(),
            ],
        }
    }
}

/// Build a squashfs image from `staging_dir` at `output`.
///
/// The image is written to `<output>.work` and renamed into place once
/// mksquashfs succeeds, so a failed build never leaves a truncated image
/// where the ISO expects a good one.
pub fn package_directory(
    runner: &dyn Runner,
    staging_dir: &Path,
    output: &Path,
    codec: Codec,
    excludes: &ExcludeRules,
) -> Result<()> {
    if !staging_dir.is_dir() {
        bail!(
            "Staging directory does not exist: {}\nRun the clone step first.",
            staging_dir.display()
        );
    }
    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create output directory: {}", parent.display()))?;
    }

    let work = work_path(output);
    if work.exists() {
        fs::remove_file(&work)
            .with_context(|| format!("removing stale work file '{}'", work.display()))?;
    }

    println!("Creating squashfs image ({:?})...", codec);
    // mksquashfs argument order is SOURCE OUTPUT
    runner.run(
        &Cmd::new("mksquashfs")
            .arg_path(staging_dir)
            .arg_path(&work)
            .arg("-noappend")
            .args(codec.args())
            .args(["-b", "1M", "-always-use-fragments", "-xattrs"])
            .args(excludes.mksquashfs_args())
            .error_msg(
                "mksquashfs failed. Install squashfs-tools:\n\
                 On Arch: sudo pacman -S squashfs-tools\n\
                 On Debian/Ubuntu: sudo apt-get install squashfs-tools",
            ),
    )?;

    fs::rename(&work, output).with_context(|| {
        format!(
            "moving '{}' into place at '{}'",
            work.display(),
            output.display()
        )
    })?;

    if let Ok(metadata) = fs::metadata(output) {
        println!("Squashfs created: {} MB", metadata.len() / 1024 / 1024);
    }
    Ok(())
}

fn work_path(output: &Path) -> PathBuf {
    let mut name = output.as_os_str().to_os_string();
    name.push(".work");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::testing::RecordingRunner;
    use crate::process::SystemRunner;
    use tempfile::TempDir;

    #[test]
    #[ignore = "needs mksquashfs on the host"]
    fn duplicate_files_compress_well() {
        let tmp = TempDir::new().unwrap();
        let staging = tmp.path().join("staging");
        fs::create_dir_all(&staging).unwrap();
        let block: Vec<u8> = (0..10 * 1024 * 1024u32).map(|i| (i % 251) as u8).collect();
        fs::write(staging.join("a.bin"), &block).unwrap();
        fs::write(staging.join("b.bin"), &block).unwrap();

        let output = tmp.path().join("out/root.sfs");
        package_directory(
            &SystemRunner,
            &staging,
            &output,
            Codec::Zstd { level: 3 },
            &ExcludeRules::none(),
        )
        .unwrap();

        let size = fs::metadata(&output).unwrap().len();
        assert!(size < 20 * 1024 * 1024, "image is {} bytes", size);
        assert!(!work_path(&output).exists());
    }

    #[test]
    fn missing_staging_spawns_nothing() {
        let tmp = TempDir::new().unwrap();
        let runner = RecordingRunner::new();
        let result = package_directory(
            &runner,
            &tmp.path().join("absent"),
            &tmp.path().join("root.sfs"),
            Codec::Xz,
            &ExcludeRules::none(),
        );
        assert!(result.is_err());
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn xz_invocation_shape() {
        let tmp = TempDir::new().unwrap();
        let staging = tmp.path().join("staging");
        fs::create_dir_all(&staging).unwrap();
        let output = tmp.path().join("root.sfs");
        fs::write(work_path(&output), "stale").unwrap();
        let runner = RecordingRunner::new();

        // The recording runner never writes the work file, so the rename fails.
        let result = package_directory(
            &runner,
            &staging,
            &output,
            Codec::Xz,
            &ExcludeRules::none().with_pattern("/proc/*"),
        );
        assert!(result.is_err());

        let call = &runner.calls()[0];
        assert!(call.contains("root.sfs.work -noappend -comp xz -Xbcj x86 -b 1M"));
        assert!(call.ends_with("-wildcards -e 'proc/*'"));
        assert!(!output.exists());
    }
}
