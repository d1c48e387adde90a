use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use live_builder::artifact::block_image::FsKind;
use live_builder::artifact::squashfs::Codec;
use live_builder::boot::BootConfigKind;
use live_builder::config::FileConfigStore;
use live_builder::error::StageError;
use live_builder::operator::Operator;
use live_builder::pipeline::{CloneSource, Session};
use live_builder::process::SystemRunner;
use live_builder::profile::DistroProfile;
use live_builder::logging;

mod menu;

const GIB: u64 = 1024 * 1024 * 1024;

fn usage() -> &'static str {
    "Usage:\n  live-builder                      interactive menu\n  live-builder status\n  live-builder deps\n  live-builder set <key> <value>\n  live-builder select-kernel [<n>]\n  live-builder clone [live|two-phase|device <dev>|path <path>]\n  live-builder squashfs [xz|zstd <level>]\n  live-builder image <size-gb> <btrfs|ext4>\n  live-builder iso\n  live-builder initramfs\n  live-builder edit <grub|boot-text|branding>\n  live-builder targets\n  live-builder write <iso> <device>\n  live-builder test-iso [<iso>] [--uefi]\n  live-builder install <device> <btrfs|ext4> [plan.toml]\n  live-builder delete-staging\n\nNumeric aliases: 3 iso, 4 squashfs, 5 initramfs, 6 edit boot-text, 7 edit grub, 8 setup menu"
}

fn main() {
    logging::init();
    match run() {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(err) => {
            eprintln!("Error: {:#}", err);
            std::process::exit(1);
        }
    }
}

/// `Ok(false)` when an interactive session saw a stage abort.
fn run() -> Result<bool> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if matches!(args.as_slice(), [h] if h == "-h" || h == "--help" || h == "help") {
        println!("{}", usage());
        return Ok(true);
    }

    let runner = SystemRunner;
    let operator = Operator::resolve()?;
    let profile = DistroProfile::detect()?;
    let store = FileConfigStore::for_operator(&operator);
    let mut session = Session::open(&runner, Box::new(store), profile, operator)?;

    if args.is_empty() {
        return menu::interactive(&mut session);
    }
    dispatch(&mut session, &args)?;
    Ok(true)
}

fn dispatch(session: &mut Session<'_>, args: &[String]) -> Result<()> {
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    match args.as_slice() {
        ["status"] => print!("{}", session.status()?),
        ["deps"] => session.install_dependencies()?,
        ["set", key, value] => session.set_value(key, value)?,
        ["select-kernel"] => menu::print_kernels(session)?,
        ["select-kernel", n] => {
            let dest = session.select_kernel(parse_index(n)?)?;
            println!("Kernel copied to {}", dest.display());
        }
        ["clone"] | ["clone", "live"] => {
            session.clone(CloneSource::Live)?;
        }
        ["clone", "two-phase"] => {
            session.clone(CloneSource::LiveTwoPhase)?;
        }
        ["clone", "device", device] => {
            session.clone(CloneSource::Device(PathBuf::from(device)))?;
        }
        ["clone", "path", path] => {
            let dest = session.clone(CloneSource::Path(PathBuf::from(path)))?;
            println!("Copied into {}", dest.display());
        }
        ["4"] | ["squashfs"] | ["squashfs", "xz"] => {
            session.build_image(Codec::Xz)?;
        }
        ["squashfs", "zstd", level] => {
            session.build_image(Codec::Zstd {
                level: parse_level(level)?,
            })?;
        }
        ["image", size, fs] => {
            let fs_kind: FsKind = fs.parse()?;
            session.build_block_image(parse_size_gb(size)?, fs_kind)?;
        }
        ["3"] | ["iso"] => {
            session.build_iso()?;
        }
        ["5"] | ["initramfs"] => {
            let out = session.generate_initramfs()?;
            println!("Initramfs written to {}", out.display());
        }
        ["6"] | ["edit", "boot-text"] => {
            session.edit(BootConfigKind::BootText)?;
        }
        ["7"] | ["edit", "grub"] => {
            session.edit(BootConfigKind::Grub)?;
        }
        ["edit", "branding"] => {
            session.edit(BootConfigKind::Branding)?;
        }
        ["8"] => menu::setup(session)?,
        ["targets"] => menu::print_targets(session)?,
        ["write", iso, device] => write(session, Path::new(iso), Path::new(device))?,
        ["install", device, fs] => install(session, Path::new(device), fs, None)?,
        ["install", device, fs, plan] => {
            install(session, Path::new(device), fs, Some(Path::new(plan)))?
        }
        ["test-iso"] => test_iso(session, None, false)?,
        ["test-iso", "--uefi"] => test_iso(session, None, true)?,
        ["test-iso", iso] => test_iso(session, Some(Path::new(iso)), false)?,
        ["test-iso", iso, "--uefi"] => test_iso(session, Some(Path::new(iso)), true)?,
        ["delete-staging"] => session.delete_staging()?,
        _ => bail!(usage()),
    }
    Ok(())
}

fn test_iso(session: &mut Session<'_>, iso: Option<&Path>, uefi: bool) -> Result<()> {
    let booted = session.test_iso(iso, uefi)?;
    println!("QEMU exited for {}", booted.display());
    Ok(())
}

fn write(session: &mut Session<'_>, iso: &Path, device: &Path) -> Result<()> {
    let question = format!(
        "Write {} to {}? Everything on {} will be destroyed.",
        iso.display(),
        device.display(),
        device.display()
    );
    if !confirm(&question)? {
        println!("Aborted.");
        return Ok(());
    }
    session.write(iso, device)
}

fn install(session: &mut Session<'_>, device: &Path, fs: &str, plan: Option<&Path>) -> Result<()> {
    let fs_kind: FsKind = fs.parse()?;
    let question = format!(
        "Install onto {} as {}? The disk will be wiped.",
        device.display(),
        fs_kind
    );
    if !confirm(&question)? {
        println!("Aborted.");
        return Ok(());
    }
    session.install(device, fs_kind, plan)
}

pub(crate) fn parse_index(text: &str) -> Result<usize, StageError> {
    text.trim()
        .parse()
        .map_err(|_| StageError::invalid_input("selection", format!("'{}' is not a number", text)))
}

pub(crate) fn parse_size_gb(text: &str) -> Result<u64, StageError> {
    let gb: u64 = text
        .trim()
        .parse()
        .map_err(|_| StageError::invalid_input("size", format!("'{}' is not a whole number of GB", text)))?;
    gb.checked_mul(GIB)
        .filter(|bytes| *bytes > 0)
        .ok_or_else(|| StageError::invalid_input("size", "image size must be greater than zero"))
}

fn parse_level(text: &str) -> Result<u8, StageError> {
    text.trim()
        .parse()
        .ok()
        .filter(|level| (1..=22).contains(level))
        .ok_or_else(|| StageError::invalid_input("level", format!("'{}' is not 1-22", text)))
}

/// Read one trimmed line. `None` at end of input.
pub(crate) fn prompt(label: &str) -> Result<Option<String>> {
    print!("{}", label);
    io::stdout().flush()?;
    let mut line = String::new();
    if io::stdin().lock().read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim().to_string()))
}

/// Only a literal `yes` confirms.
pub(crate) fn confirm(question: &str) -> Result<bool> {
    let answer = prompt(&format!("{} Type 'yes' to continue: ", question))?;
    Ok(answer.as_deref() == Some("yes"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_is_whole_gib() {
        assert_eq!(parse_size_gb("20").unwrap(), 20 * GIB);
        assert!(parse_size_gb("0").is_err());
        assert!(parse_size_gb("1.5").is_err());
    }

    #[test]
    fn zstd_level_range() {
        assert_eq!(parse_level("22").unwrap(), 22);
        assert!(parse_level("0").is_err());
        assert!(parse_level("23").is_err());
    }

    #[test]
    fn menu_keys_are_unique() {
        let mut keys: Vec<_> = menu::MAIN_MENU.iter().map(|(k, _)| *k).collect();
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), menu::MAIN_MENU.len());
    }
}
