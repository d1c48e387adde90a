//! Hybrid BIOS/UEFI ISO assembly with xorriso.
//!
//! The build tree already holds the bootloader images; this module only
//! lays them out as El Torito entries plus an appended EFI system partition
//! so the same file boots from optical media, USB sticks and UEFI firmware.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use time::macros::format_description;
use time::OffsetDateTime;

use crate::artifact::checksum;
use crate::config::{PipelineConfig, ReadinessMode};
use crate::operator::Operator;
use crate::process::{Cmd, Runner};
use crate::profile::DistroProfile;

/// Architecture tag in ISO file names.
pub const ISO_ARCH: &str = "amd64";

/// Local time, falling back to UTC when the offset cannot be determined.
pub fn now() -> OffsetDateTime {
    OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc())
}

/// `{name}_{arch}_{yyyy-mm-dd_HHMM}.iso`, with a trailing `.iso` on
/// `iso_name` dropped.
pub fn iso_file_name(iso_name: &str, at: OffsetDateTime) -> Result<String> {
    let base = iso_name.trim();
    let base = base.strip_suffix(".iso").unwrap_or(base);
    let stamp = at
        .format(format_description!("[year]-[month]-[day]_[hour][minute]"))
        .context("formatting ISO timestamp")?;
    Ok(format!("{}_{}_{}.iso", base, ISO_ARCH, stamp))
}

/// First of `file_name`, `stem-2.iso`, `stem-3.iso`... not yet present in
/// `dir`.
pub fn unique_iso_path(dir: &Path, file_name: &str) -> PathBuf {
    let candidate = dir.join(file_name);
    if !candidate.exists() {
        return candidate;
    }
    let stem = file_name.strip_suffix(".iso").unwrap_or(file_name);
    (2u32..)
        .map(|n| dir.join(format!("{}-{}.iso", stem, n)))
        .find(|path| !path.exists())
        .unwrap_or(candidate)
}

/// `--modification-date` value: `YYYYMMDDhhmmsscc`, centiseconds zeroed.
pub fn modification_date(at: OffsetDateTime) -> Result<String> {
    let stamp = at
        .format(format_description!("[year][month][day][hour][minute][second]"))
        .context("formatting ISO modification date")?;
    Ok(format!("{}00", stamp))
}

/// The xorriso invocation for `build_root`.
pub fn xorriso_cmd(
    profile: &DistroProfile,
    build_root: &Path,
    volume_id: &str,
    output: &Path,
    at: OffsetDateTime,
) -> Result<Cmd> {
    let date = format!("--modification-date={}", modification_date(at)?);
    Ok(Cmd::new("xorriso")
        .args(["-as", "mkisofs", date.as_str(), "--protective-msdos-label"])
        .args(["-volid", volume_id])
        .args(["-appid", volume_id, "-publisher", volume_id, "-preparer", "live-builder"])
        .args(["-r", "-graft-points", "-no-pad"])
        .args(["--sort-weight", "0", "/", "--sort-weight", "1", "/boot"])
        .arg("--grub2-mbr")
        .arg_path(&build_root.join(profile.hybrid_mbr))
        .args(["-partition_offset", "16"])
        .args(["-b", profile.eltorito_image, "-c", "boot.catalog"])
        .args(["-no-emul-boot", "-boot-load-size", "4", "-boot-info-table", "--grub2-boot-info"])
        .arg("-eltorito-alt-boot")
        .args(["-append_partition", "2", "0xef"])
        .arg_path(&build_root.join(profile.efi_image))
        .args(["-e", "--interval:appended_partition_2:all::", "-no-emul-boot"])
        .args(["-iso-level", "3"])
        .arg("-o")
        .arg_path(output)
        .arg_path(build_root)
        .error_msg(
            "xorriso failed. Install it:\n\
             On Arch: sudo pacman -S libisoburn\n\
             On Debian/Ubuntu: sudo apt-get install xorriso",
        ))
}

/// Build the ISO described by `config` from `build_root`.
///
/// Refuses with `PreconditionNotMet` before anything runs when the
/// configuration is not ready. The ISO and its checksum are handed to the
/// operator afterward.
pub fn assemble(
    runner: &dyn Runner,
    config: &PipelineConfig,
    profile: &DistroProfile,
    build_root: &Path,
    operator: &Operator,
    at: OffsetDateTime,
) -> Result<PathBuf> {
    config.require(ReadinessMode::Iso)?;

    let output_dir = Path::new(&config.output_dir);
    fs::create_dir_all(output_dir)
        .with_context(|| format!("creating output directory '{}'", output_dir.display()))?;

    let output = unique_iso_path(output_dir, &iso_file_name(&config.iso_name, at)?);
    println!("=== Building ISO {} ===\n", output.display());

    runner.run(&xorriso_cmd(profile, build_root, &config.iso_tag, &output, at)?)?;

    let sidecar = checksum::checksum(&output)?;
    operator.chown(&output)?;
    operator.chown(&sidecar)?;

    println!("\n=== ISO ready: {} ===", output.display());
    Ok(output)
}
