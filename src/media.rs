//! Writing finished ISOs to physical media.
//!
//! Target discovery reads `/sys/block` directly. Asking the operator to
//! confirm a target is the caller's job; [`write_iso`] only checks that the
//! target really is a block device.

use anyhow::{bail, Context, Result};
use std::fs;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

use crate::process::{Cmd, Runner};

pub const SYS_BLOCK: &str = "/sys/block";

/// Device name prefixes never offered as targets.
const VIRTUAL_PREFIXES: &[&str] = &["loop", "ram", "zram"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDevice {
    pub name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub removable: bool,
    pub model: String,
}

impl BlockDevice {
    pub fn describe(&self) -> String {
        format!(
            "{:<12} {:>8.1} GiB  {}{}",
            self.path.display(),
            self.size_bytes as f64 / (1u64 << 30) as f64,
            if self.model.is_empty() { "unknown model" } else { self.model.as_str() },
            if self.removable { "  [removable]" } else { "" }
        )
    }
}

/// Candidate targets on this host.
pub fn list_removable_targets() -> Result<Vec<BlockDevice>> {
    list_block_devices(Path::new(SYS_BLOCK))
}

/// Block devices under a sysfs `block` directory, skipping virtual ones.
pub fn list_block_devices(sys_block: &Path) -> Result<Vec<BlockDevice>> {
    let mut devices = Vec::new();
    for entry in fs::read_dir(sys_block)
        .with_context(|| format!("reading '{}'", sys_block.display()))?
    {
        let entry = entry.with_context(|| format!("iterating '{}'", sys_block.display()))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if VIRTUAL_PREFIXES.iter().any(|p| name.starts_with(p)) {
            continue;
        }
        let dir = entry.path();
        let sectors: u64 = read_trimmed(&dir.join("size")).parse().unwrap_or(0);
        devices.push(BlockDevice {
            path: PathBuf::from("/dev").join(&name),
            size_bytes: sectors * 512,
            removable: read_trimmed(&dir.join("removable")) == "1",
            model: read_trimmed(&dir.join("device/model")),
            name,
        });
    }
    devices.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(devices)
}

fn read_trimmed(path: &Path) -> String {
    fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

/// `*.iso` files in `dir`, sorted.
pub fn list_isos(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut isos: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("reading '{}'", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "iso") && path.is_file())
        .collect();
    isos.sort();
    Ok(isos)
}

/// Raw-copy `iso` onto `target`. Everything on the target is destroyed.
pub fn write_iso(runner: &dyn Runner, iso: &Path, target: &Path) -> Result<()> {
    if !iso.is_file() {
        bail!("ISO not found: {}", iso.display());
    }
    let metadata =
        fs::metadata(target).with_context(|| format!("inspecting target '{}'", target.display()))?;
    if !metadata.file_type().is_block_device() {
        bail!("{} is not a block device", target.display());
    }

    println!("=== Writing {} to {} ===\n", iso.display(), target.display());
    runner.run(
        &Cmd::new("dd")
            .arg(format!("if={}", iso.display()))
            .arg(format!("of={}", target.display()))
            .args(["bs=4M", "status=progress", "oflag=sync", "conv=fsync"])
            .error_msg("dd failed. Is the target unmounted and large enough?"),
    )?;
    println!("\n=== Write complete ===");
    Ok(())
}
