//! Partition and subvolume layout for a target disk.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::artifact::block_image::FsKind;
use crate::error::StageError;

const MIB: u64 = 1024 * 1024;

/// ESP spans 1MiB..551MiB.
pub const ESP_START_MIB: u64 = 1;
pub const ESP_END_MIB: u64 = 551;

/// Smallest root partition worth installing onto.
pub const MIN_ROOT_MIB: u64 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionRole {
    Esp,
    Root,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub number: u32,
    pub role: PartitionRole,
    pub node: PathBuf,
    pub start_mib: u64,
    /// `None` extends to the end of the disk.
    pub end_mib: Option<u64>,
    pub size_bytes: u64,
}

impl Partition {
    /// `parted mkpart` bounds.
    pub fn parted_bounds(&self) -> (String, String) {
        let end = match self.end_mib {
            Some(end) => format!("{}MiB", end),
            None => "100%".to_string(),
        };
        (format!("{}MiB", self.start_mib), end)
    }
}

/// A btrfs subvolume and where it is mounted in the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subvolume {
    pub name: &'static str,
    /// Relative to the target root; empty for the root subvolume.
    pub mount_at: &'static str,
}

/// Root first; nested subvolumes live inside `@` and come last.
pub const SUBVOLUMES: &[Subvolume] = &[
    Subvolume { name: "@", mount_at: "" },
    Subvolume { name: "@home", mount_at: "home" },
    Subvolume { name: "@root", mount_at: "root" },
    Subvolume { name: "@srv", mount_at: "srv" },
    Subvolume { name: "@cache", mount_at: "var/cache" },
    Subvolume { name: "@tmp", mount_at: "tmp" },
    Subvolume { name: "@log", mount_at: "var/log" },
    Subvolume { name: "@/var/lib/portables", mount_at: "var/lib/portables" },
    Subvolume { name: "@/var/lib/machines", mount_at: "var/lib/machines" },
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskLayout {
    pub device: PathBuf,
    pub fs_kind: FsKind,
    pub partitions: Vec<Partition>,
    /// Empty for ext4.
    pub subvolumes: Vec<Subvolume>,
}

impl DiskLayout {
    /// GPT with an ESP and a root partition filling the rest.
    pub fn plan(device: &Path, disk_size_bytes: u64, fs_kind: FsKind) -> Result<Self, StageError> {
        let disk_mib = disk_size_bytes / MIB;
        if disk_mib < ESP_END_MIB + MIN_ROOT_MIB {
            return Err(StageError::invalid_input(
                "device",
                format!(
                    "{} is {} MiB, need at least {} MiB",
                    device.display(),
                    disk_mib,
                    ESP_END_MIB + MIN_ROOT_MIB
                ),
            ));
        }

        let partitions = vec![
            Partition {
                number: 1,
                role: PartitionRole::Esp,
                node: partition_node(device, 1),
                start_mib: ESP_START_MIB,
                end_mib: Some(ESP_END_MIB),
                size_bytes: (ESP_END_MIB - ESP_START_MIB) * MIB,
            },
            Partition {
                number: 2,
                role: PartitionRole::Root,
                node: partition_node(device, 2),
                start_mib: ESP_END_MIB,
                end_mib: None,
                size_bytes: disk_size_bytes - ESP_END_MIB * MIB,
            },
        ];

        let subvolumes = match fs_kind {
            FsKind::Btrfs => SUBVOLUMES.to_vec(),
            FsKind::Ext4 => Vec::new(),
        };

        Ok(Self {
            device: device.to_path_buf(),
            fs_kind,
            partitions,
            subvolumes,
        })
    }

    pub fn esp(&self) -> &Partition {
        &self.partitions[0]
    }

    pub fn root(&self) -> &Partition {
        &self.partitions[1]
    }
}

/// `/dev/sda` + 1 -> `/dev/sda1`; `/dev/nvme0n1` + 1 -> `/dev/nvme0n1p1`.
///
/// Devices whose name ends in a digit take a `p` separator.
pub fn partition_node(device: &Path, number: u32) -> PathBuf {
    let text = device.display().to_string();
    let needs_p = text.ends_with(|c: char| c.is_ascii_digit());
    if needs_p {
        PathBuf::from(format!("{}p{}", text, number))
    } else {
        PathBuf::from(format!("{}{}", text, number))
    }
}

/// Size of a whole-disk device from sysfs.
pub fn device_size_bytes(device: &Path) -> Result<u64> {
    let name = device
        .file_name()
        .and_then(|n| n.to_str())
        .context("device path has no name")?;
    let size_file = Path::new("/sys/class/block").join(name).join("size");
    let sectors: u64 = fs::read_to_string(&size_file)
        .with_context(|| format!("reading '{}'", size_file.display()))?
        .trim()
        .parse()
        .with_context(|| format!("parsing '{}'", size_file.display()))?;
    Ok(sectors * 512)
}
