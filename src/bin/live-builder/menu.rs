//! Line-based interactive mode.

use std::path::PathBuf;

use anyhow::Result;
use live_builder::artifact::block_image::FsKind;
use live_builder::artifact::squashfs::Codec;
use live_builder::boot::BootConfigKind;
use live_builder::config::ConfigKey;
use live_builder::pipeline::{CloneSource, Session};
use live_builder::ticker::Ticker;

use crate::{confirm, parse_index, parse_size_gb, prompt};

pub(crate) const MAIN_MENU: &[(&str, &str)] = &[
    ("1", "Status"),
    ("2", "Install dependencies"),
    ("3", "Build ISO"),
    ("4", "Build root image (squashfs)"),
    ("5", "Generate initramfs"),
    ("6", "Edit boot text"),
    ("7", "Edit GRUB config"),
    ("8", "Setup"),
    ("9", "Clone"),
    ("10", "Build block image"),
    ("11", "Write ISO to media"),
    ("12", "Install to disk"),
    ("13", "Delete staging tree"),
    ("14", "Boot latest ISO in QEMU"),
    ("q", "Quit"),
];

const TEXT_KEYS: &[ConfigKey] = &[
    ConfigKey::IsoTag,
    ConfigKey::IsoName,
    ConfigKey::OutputDir,
    ConfigKey::CloneDir,
    ConfigKey::Editor,
];

/// Returns `false` if any stage aborted during the session.
pub fn interactive(session: &mut Session<'_>) -> Result<bool> {
    let ticker = Ticker::start();
    let mut clean = true;
    loop {
        println!();
        println!("live-builder [{}]  {}", ticker.now(), session.profile().name());
        for (key, label) in MAIN_MENU {
            println!("  {:>2}) {}", key, label);
        }
        let Some(choice) = prompt("> ")? else {
            break;
        };
        if choice == "q" {
            break;
        }
        if let Err(err) = main_choice(session, &choice) {
            eprintln!("Error: {:#}", err);
            clean = false;
        }
    }
    Ok(clean)
}

fn main_choice(session: &mut Session<'_>, choice: &str) -> Result<()> {
    match choice {
        "1" => print!("{}", session.status()?),
        "2" => session.install_dependencies()?,
        "3" => {
            session.build_iso()?;
        }
        "4" => {
            session.build_image(Codec::Xz)?;
        }
        "5" => {
            session.generate_initramfs()?;
        }
        "6" => {
            session.edit(BootConfigKind::BootText)?;
        }
        "7" => {
            session.edit(BootConfigKind::Grub)?;
        }
        "8" => setup(session)?,
        "9" => clone(session)?,
        "10" => block_image(session)?,
        "11" => write(session)?,
        "12" => install(session)?,
        "13" => {
            if confirm("Delete the staging tree and its block image?")? {
                session.delete_staging()?;
            }
        }
        "14" => {
            let uefi = prompt("Boot with UEFI? [y/N]: ")?.is_some_and(|a| a.eq_ignore_ascii_case("y"));
            session.test_iso(None, uefi)?;
        }
        "" => {}
        other => println!("Unknown choice '{}'", other),
    }
    Ok(())
}

/// Values, kernel and branding.
pub fn setup(session: &mut Session<'_>) -> Result<()> {
    loop {
        println!();
        println!("Setup");
        for (i, key) in TEXT_KEYS.iter().enumerate() {
            let value = session.config().value_of(*key);
            println!("  {}) {} [{}]", i + 1, key.name(), value);
        }
        let kernel_item = TEXT_KEYS.len() + 1;
        println!("  {}) Select kernel", kernel_item);
        println!("  {}) Edit installer branding", kernel_item + 1);
        println!("  b) Back");

        let Some(choice) = prompt("> ")? else {
            return Ok(());
        };
        if choice == "b" || choice.is_empty() {
            return Ok(());
        }
        let index = parse_index(&choice)?;
        if index >= 1 && index <= TEXT_KEYS.len() {
            let key = TEXT_KEYS[index - 1];
            if let Some(value) = prompt(&format!("{}: ", key.name()))? {
                session.set_value(key.name(), &value)?;
            }
        } else if index == kernel_item {
            print_kernels(session)?;
            if let Some(choice) = prompt("Kernel number: ")? {
                let dest = session.select_kernel(parse_index(&choice)?)?;
                println!("Kernel copied to {}", dest.display());
            }
        } else if index == kernel_item + 1 {
            session.edit(BootConfigKind::Branding)?;
        } else {
            println!("Unknown choice '{}'", choice);
        }
    }
}

pub fn print_kernels(session: &Session<'_>) -> Result<()> {
    let kernels = session.kernels()?;
    if kernels.is_empty() {
        println!("No kernels found.");
    }
    for (i, kernel) in kernels.iter().enumerate() {
        println!("  {}) {}", i + 1, kernel.display());
    }
    Ok(())
}

pub fn print_targets(session: &Session<'_>) -> Result<()> {
    let targets = session.removable_targets()?;
    if targets.is_empty() {
        println!("No removable drives found.");
    }
    for target in targets {
        println!("  {}", target.describe());
    }
    Ok(())
}

fn clone(session: &mut Session<'_>) -> Result<()> {
    println!("  1) Live system");
    println!("  2) Live system, /usr in a second pass");
    println!("  3) Another drive");
    println!("  4) A folder or file");
    let Some(choice) = prompt("> ")? else {
        return Ok(());
    };
    let source = match choice.as_str() {
        "1" => CloneSource::Live,
        "2" => CloneSource::LiveTwoPhase,
        "3" => match prompt("Device (e.g. /dev/sdb1): ")? {
            Some(device) => CloneSource::Device(PathBuf::from(device)),
            None => return Ok(()),
        },
        "4" => match prompt("Path: ")? {
            Some(path) => CloneSource::Path(PathBuf::from(path)),
            None => return Ok(()),
        },
        _ => return Ok(()),
    };
    let dest = session.clone(source)?;
    println!("Clone ready at {}", dest.display());
    Ok(())
}

fn block_image(session: &mut Session<'_>) -> Result<()> {
    let Some(size) = prompt("Image size in GB: ")? else {
        return Ok(());
    };
    let size_bytes = parse_size_gb(&size)?;
    let Some(fs) = prompt("Filesystem (btrfs/ext4): ")? else {
        return Ok(());
    };
    let fs_kind: FsKind = fs.parse()?;
    session.build_block_image(size_bytes, fs_kind)?;
    Ok(())
}

fn write(session: &mut Session<'_>) -> Result<()> {
    let isos = session.isos()?;
    if isos.is_empty() {
        println!("No ISOs in the output directory.");
        return Ok(());
    }
    for (i, iso) in isos.iter().enumerate() {
        println!("  {}) {}", i + 1, iso.display());
    }
    let Some(choice) = prompt("ISO number: ")? else {
        return Ok(());
    };
    let index = parse_index(&choice)?;
    let Some(iso) = index.checked_sub(1).and_then(|i| isos.get(i)).cloned() else {
        println!("Unknown choice '{}'", choice);
        return Ok(());
    };

    print_targets(session)?;
    let Some(device) = prompt("Target device (e.g. /dev/sdb): ")? else {
        return Ok(());
    };
    let device = PathBuf::from(device);
    let question = format!(
        "Write {} to {}? Everything on it will be destroyed.",
        iso.display(),
        device.display()
    );
    if confirm(&question)? {
        session.write(&iso, &device)?;
    }
    Ok(())
}

fn install(session: &mut Session<'_>) -> Result<()> {
    let Some(device) = prompt("Target disk (e.g. /dev/nvme0n1): ")? else {
        return Ok(());
    };
    let Some(fs) = prompt("Filesystem (btrfs/ext4): ")? else {
        return Ok(());
    };
    let fs_kind: FsKind = fs.parse()?;
    let plan = prompt("Provisioning plan (empty for defaults): ")?
        .filter(|p| !p.is_empty())
        .map(PathBuf::from);

    let device = PathBuf::from(device);
    let question = format!("Install onto {} as {}? The disk will be wiped.", device.display(), fs_kind);
    if confirm(&question)? {
        session.install(&device, fs_kind, plan.as_deref())?;
    }
    Ok(())
}
