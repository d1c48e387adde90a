//! Provisioning plans.
//!
//! A plan says what goes onto a freshly partitioned disk: the user account,
//! timezone, base package manifest and any payload archives. Plans are
//! optional TOML files; without one the profile defaults apply.
//!
//! ```toml
//! [install]
//! username = "demo"
//! timezone = "Europe/London"
//! compression_level = 15
//!
//! [[payload]]
//! url = "https://example.org/home.sfs"
//! dest = "home"
//! unsquash = true
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::profile::DistroProfile;

const DEFAULT_TIMEZONE: &str = "Europe/London";
const DEFAULT_CMDLINE: &str = "quiet splash";
const DEFAULT_COMPRESSION_LEVEL: u8 = 22;

/// Base system for pacstrap installs.
pub const PACSTRAP_MANIFEST: &[&str] = &[
    "base",
    "base-devel",
    "linux",
    "linux-firmware",
    "linux-headers",
    "grub",
    "efibootmgr",
    "os-prober",
    "btrfs-progs",
    "dosfstools",
    "networkmanager",
    "sddm",
    "plasma-meta",
    "konsole",
    "dolphin",
    "sudo",
    "nano",
    "spice-vdagent",
    "squashfs-tools",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub url: String,
    /// Destination relative to the target root.
    pub dest: String,
    pub unsquash: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionPlan {
    pub username: Option<String>,
    pub timezone: String,
    pub kernel_cmdline: String,
    pub compression_level: u8,
    pub packages: Vec<String>,
    pub display_manager: String,
    pub network_service: String,
    /// Run `passwd` for the user and root. Off for unattended installs.
    pub set_passwords: bool,
    pub payloads: Vec<Payload>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PlanToml {
    install: Option<InstallToml>,
    #[serde(default)]
    payload: Vec<PayloadToml>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct InstallToml {
    username: Option<String>,
    timezone: Option<String>,
    kernel_cmdline: Option<String>,
    compression_level: Option<u8>,
    packages: Option<Vec<String>>,
    display_manager: Option<String>,
    network_service: Option<String>,
    set_passwords: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PayloadToml {
    url: String,
    dest: String,
    #[serde(default)]
    unsquash: bool,
}

impl ProvisionPlan {
    pub fn defaults(profile: &DistroProfile) -> Self {
        Self {
            username: None,
            timezone: DEFAULT_TIMEZONE.to_string(),
            kernel_cmdline: DEFAULT_CMDLINE.to_string(),
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            packages: PACSTRAP_MANIFEST.iter().map(|p| p.to_string()).collect(),
            display_manager: profile.display_manager.to_string(),
            network_service: profile.network_service.to_string(),
            set_passwords: true,
            payloads: Vec::new(),
        }
    }

    pub fn load(path: &Path, profile: &DistroProfile) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading provisioning plan '{}'", path.display()))?;
        Self::parse(&text, profile)
            .with_context(|| format!("parsing provisioning plan '{}'", path.display()))
    }

    pub fn parse(text: &str, profile: &DistroProfile) -> Result<Self> {
        let parsed: PlanToml = toml::from_str(text)?;
        let install = parsed.install.unwrap_or_default();
        let defaults = Self::defaults(profile);

        let compression_level = install
            .compression_level
            .unwrap_or(defaults.compression_level);
        if !(1..=22).contains(&compression_level) {
            bail!("compression_level must be between 1 and 22, got {}", compression_level);
        }

        let mut payloads = Vec::new();
        for p in parsed.payload {
            let dest = p.dest.trim().trim_start_matches('/').to_string();
            if dest.is_empty() || dest.split('/').any(|part| part == "..") {
                bail!("payload dest '{}' must be a relative path inside the target", p.dest);
            }
            payloads.push(Payload {
                url: p.url,
                dest,
                unsquash: p.unsquash,
            });
        }

        Ok(Self {
            username: install.username.filter(|u| !u.trim().is_empty()),
            timezone: install.timezone.unwrap_or(defaults.timezone),
            kernel_cmdline: install.kernel_cmdline.unwrap_or(defaults.kernel_cmdline),
            compression_level,
            packages: install.packages.unwrap_or(defaults.packages),
            display_manager: install.display_manager.unwrap_or(defaults.display_manager),
            network_service: install.network_service.unwrap_or(defaults.network_service),
            set_passwords: install.set_passwords.unwrap_or(defaults.set_passwords),
            payloads,
        })
    }
}
