//! Persisted pipeline state.
//!
//! A flat `key=value` file under `~/.config/live-builder/configuration.txt`.
//! Every setup action mutates a [`PipelineConfig`] and saves it straight
//! away, so an interrupted run resumes from whatever flags were recorded.
//!
//! The readiness predicate decides whether the ISO and image stages may run.
//! Stages call [`PipelineConfig::require`] before spawning anything.

use anyhow::{Context, Result};
use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::StageError;
use crate::operator::Operator;

pub const CONFIG_FILENAME: &str = "configuration.txt";

/// Editor used when none is configured.
pub const DEFAULT_EDITOR: &str = "nano";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineConfig {
    pub iso_tag: String,
    pub iso_name: String,
    pub output_dir: String,
    pub kernel_image_path: String,
    pub clone_dir: String,
    pub editor: String,
    pub dependencies_installed: bool,
    pub initramfs_generated: bool,
    pub boot_config_edited: bool,
    pub boot_text_edited: bool,
    pub branding_edited: bool,
}

/// Which stage the readiness predicate is evaluated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessMode {
    Iso,
    Image,
}

impl ReadinessMode {
    pub fn stage_name(self) -> &'static str {
        match self {
            ReadinessMode::Iso => "iso",
            ReadinessMode::Image => "image",
        }
    }
}

/// Settable keys, in the order they are written to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigKey {
    IsoTag,
    IsoName,
    OutputDir,
    KernelImagePath,
    CloneDir,
    Editor,
    DependenciesInstalled,
    InitramfsGenerated,
    BootConfigEdited,
    BootTextEdited,
    BrandingEdited,
}

impl ConfigKey {
    pub const ALL: [ConfigKey; 11] = [
        ConfigKey::IsoTag,
        ConfigKey::IsoName,
        ConfigKey::OutputDir,
        ConfigKey::KernelImagePath,
        ConfigKey::CloneDir,
        ConfigKey::Editor,
        ConfigKey::DependenciesInstalled,
        ConfigKey::InitramfsGenerated,
        ConfigKey::BootConfigEdited,
        ConfigKey::BootTextEdited,
        ConfigKey::BrandingEdited,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ConfigKey::IsoTag => "isoTag",
            ConfigKey::IsoName => "isoName",
            ConfigKey::OutputDir => "outputDir",
            ConfigKey::KernelImagePath => "kernelImagePath",
            ConfigKey::CloneDir => "cloneDir",
            ConfigKey::Editor => "editor",
            ConfigKey::DependenciesInstalled => "dependenciesInstalled",
            ConfigKey::InitramfsGenerated => "initramfsGenerated",
            ConfigKey::BootConfigEdited => "bootConfigEdited",
            ConfigKey::BootTextEdited => "bootTextEdited",
            ConfigKey::BrandingEdited => "brandingEdited",
        }
    }

    /// Look up a key by its current or legacy name.
    pub fn parse(name: &str) -> Option<Self> {
        let key = match name {
            "vmlinuzPath" => ConfigKey::KernelImagePath,
            "mkinitcpioGenerated" => ConfigKey::InitramfsGenerated,
            "grubEdited" => ConfigKey::BootConfigEdited,
            "calamaresBrandingEdited" => ConfigKey::BrandingEdited,
            other => return Self::ALL.into_iter().find(|k| k.name() == other),
        };
        Some(key)
    }

    pub fn is_flag(self) -> bool {
        matches!(
            self,
            ConfigKey::DependenciesInstalled
                | ConfigKey::InitramfsGenerated
                | ConfigKey::BootConfigEdited
                | ConfigKey::BootTextEdited
                | ConfigKey::BrandingEdited
        )
    }
}

impl PipelineConfig {
    /// Fresh state for a first run.
    pub fn new() -> Self {
        Self {
            editor: DEFAULT_EDITOR.to_string(),
            ..Self::default()
        }
    }

    /// Parse `key=value` lines. Unknown keys and malformed lines are skipped.
    pub fn parse(text: &str) -> Self {
        let mut config = Self::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let Some(key) = ConfigKey::parse(key.trim()) else {
                debug!(key = key.trim(), "ignoring unknown configuration key");
                continue;
            };
            let value = value.trim();
            if key.is_flag() {
                *config.flag_mut(key) = parse_flag(value).unwrap_or(false);
            } else {
                *config.text_mut(key) = value.to_string();
            }
        }
        if config.editor.is_empty() {
            config.editor = DEFAULT_EDITOR.to_string();
        }
        config
    }

    /// Serialize in fixed key order with `1`/`0` booleans.
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        for key in ConfigKey::ALL {
            out.push_str(key.name());
            out.push('=');
            out.push_str(&self.value_of(key));
            out.push('\n');
        }
        out
    }

    pub fn value_of(&self, key: ConfigKey) -> String {
        if key.is_flag() {
            let text = if self.flag(key) { "1" } else { "0" };
            text.to_string()
        } else {
            let text = match key {
                ConfigKey::IsoTag => &self.iso_tag,
                ConfigKey::IsoName => &self.iso_name,
                ConfigKey::OutputDir => &self.output_dir,
                ConfigKey::KernelImagePath => &self.kernel_image_path,
                ConfigKey::CloneDir => &self.clone_dir,
                _ => &self.editor,
            };
            text.clone()
        }
    }

    /// Apply an operator-supplied value.
    pub fn set(&mut self, key: ConfigKey, value: &str) -> Result<(), StageError> {
        let value = value.trim();
        if key.is_flag() {
            let flag = parse_flag(value).ok_or_else(|| {
                StageError::invalid_input(key.name(), format!("expected 1 or 0, got '{value}'"))
            })?;
            *self.flag_mut(key) = flag;
            return Ok(());
        }
        if value.is_empty() {
            return Err(StageError::invalid_input(key.name(), "value must not be empty"));
        }
        if key == ConfigKey::IsoTag && value.chars().any(char::is_whitespace) {
            return Err(StageError::invalid_input(
                key.name(),
                "volume id must not contain whitespace",
            ));
        }
        *self.text_mut(key) = value.to_string();
        Ok(())
    }

    /// Names of the fields that keep `mode` from being ready.
    pub fn missing(&self, mode: ReadinessMode) -> Vec<String> {
        let required: &[ConfigKey] = match mode {
            ReadinessMode::Iso => &[
                ConfigKey::IsoTag,
                ConfigKey::IsoName,
                ConfigKey::OutputDir,
                ConfigKey::KernelImagePath,
                ConfigKey::DependenciesInstalled,
                ConfigKey::InitramfsGenerated,
                ConfigKey::BootConfigEdited,
            ],
            ReadinessMode::Image => &[ConfigKey::CloneDir, ConfigKey::DependenciesInstalled],
        };
        required
            .iter()
            .filter(|key| {
                if key.is_flag() {
                    !self.flag(**key)
                } else {
                    self.value_of(**key).is_empty()
                }
            })
            .map(|key| key.name().to_string())
            .collect()
    }

    pub fn is_ready(&self, mode: ReadinessMode) -> bool {
        self.missing(mode).is_empty()
    }

    /// Fail with `PreconditionNotMet` unless `mode` is ready.
    pub fn require(&self, mode: ReadinessMode) -> Result<(), StageError> {
        let missing = self.missing(mode);
        if missing.is_empty() {
            Ok(())
        } else {
            Err(StageError::precondition(mode.stage_name(), missing))
        }
    }

    pub fn editor(&self) -> &str {
        if self.editor.is_empty() {
            DEFAULT_EDITOR
        } else {
            self.editor.as_str()
        }
    }

    fn flag(&self, key: ConfigKey) -> bool {
        match key {
            ConfigKey::DependenciesInstalled => self.dependencies_installed,
            ConfigKey::InitramfsGenerated => self.initramfs_generated,
            ConfigKey::BootConfigEdited => self.boot_config_edited,
            ConfigKey::BootTextEdited => self.boot_text_edited,
            _ => self.branding_edited,
        }
    }

    fn flag_mut(&mut self, key: ConfigKey) -> &mut bool {
        match key {
            ConfigKey::DependenciesInstalled => &mut self.dependencies_installed,
            ConfigKey::InitramfsGenerated => &mut self.initramfs_generated,
            ConfigKey::BootConfigEdited => &mut self.boot_config_edited,
            ConfigKey::BootTextEdited => &mut self.boot_text_edited,
            _ => &mut self.branding_edited,
        }
    }

    fn text_mut(&mut self, key: ConfigKey) -> &mut String {
        match key {
            ConfigKey::IsoTag => &mut self.iso_tag,
            ConfigKey::IsoName => &mut self.iso_name,
            ConfigKey::OutputDir => &mut self.output_dir,
            ConfigKey::KernelImagePath => &mut self.kernel_image_path,
            ConfigKey::CloneDir => &mut self.clone_dir,
            _ => &mut self.editor,
        }
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value {
        "1" | "true" => Some(true),
        "0" | "false" | "" => Some(false),
        _ => None,
    }
}

/// Where pipeline state is loaded from and saved to.
pub trait ConfigStore {
    fn load(&self) -> Result<PipelineConfig>;
    fn save(&self, config: &PipelineConfig) -> Result<()>;
}

/// The on-disk store. Saved files are handed to the operator when running
/// as root.
#[derive(Debug, Clone)]
pub struct FileConfigStore {
    path: PathBuf,
    owner: Option<Operator>,
}

impl FileConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            owner: None,
        }
    }

    /// `~/.config/live-builder/configuration.txt` for `operator`.
    pub fn for_operator(operator: &Operator) -> Self {
        Self {
            path: operator.state_dir().join(CONFIG_FILENAME),
            owner: Some(operator.clone()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigStore for FileConfigStore {
    fn load(&self) -> Result<PipelineConfig> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "no configuration yet, using defaults");
            return Ok(PipelineConfig::new());
        }
        let text = fs::read_to_string(&self.path)
            .with_context(|| format!("reading configuration '{}'", self.path.display()))?;
        Ok(PipelineConfig::parse(&text))
    }

    fn save(&self, config: &PipelineConfig) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("creating configuration directory '{}'", parent.display())
            })?;
            if let Some(owner) = &self.owner {
                owner.chown(parent)?;
            }
        }
        fs::write(&self.path, config.serialize())
            .with_context(|| format!("writing configuration '{}'", self.path.display()))?;
        if let Some(owner) = &self.owner {
            owner.chown(&self.path)?;
        }
        Ok(())
    }
}

/// Keeps state in memory. Used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RefCell<Option<PipelineConfig>>,
    saves: RefCell<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(config: PipelineConfig) -> Self {
        Self {
            state: RefCell::new(Some(config)),
            saves: RefCell::new(0),
        }
    }

    pub fn save_count(&self) -> usize {
        *self.saves.borrow()
    }
}

impl ConfigStore for MemoryStore {
    fn load(&self) -> Result<PipelineConfig> {
        Ok(self.state.borrow().clone().unwrap_or_else(PipelineConfig::new))
    }

    fn save(&self, config: &PipelineConfig) -> Result<()> {
        *self.state.borrow_mut() = Some(config.clone());
        *self.saves.borrow_mut() += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ready_for_iso() -> PipelineConfig {
        PipelineConfig {
            iso_tag: "2025".into(),
            iso_name: "demo.iso".into(),
            output_dir: "/tmp/out".into(),
            kernel_image_path: "/home/demo/arch/boot/vmlinuz-x86_64".into(),
            dependencies_installed: true,
            initramfs_generated: true,
            boot_config_edited: true,
            ..PipelineConfig::new()
        }
    }

    #[test]
    fn missing_initramfs_is_not_ready_for_iso() {
        let mut config = ready_for_iso();
        config.boot_text_edited = true;
        config.branding_edited = true;
        config.initramfs_generated = false;

        assert!(!config.is_ready(ReadinessMode::Iso));
        assert_eq!(config.missing(ReadinessMode::Iso), vec!["initramfsGenerated"]);
    }

    #[test]
    fn zero_is_a_valid_text_value() {
        let mut config = ready_for_iso();
        config.set(ConfigKey::IsoTag, "0").unwrap();
        config.set(ConfigKey::IsoName, "0").unwrap();

        assert!(config.is_ready(ReadinessMode::Iso));
        config.dependencies_installed = false;
        assert_eq!(config.missing(ReadinessMode::Iso), vec!["dependenciesInstalled"]);
    }

    #[test]
    fn complete_config_is_ready() {
        assert!(ready_for_iso().is_ready(ReadinessMode::Iso));
        assert!(ready_for_iso().require(ReadinessMode::Iso).is_ok());
    }

    #[test]
    fn image_mode_needs_clone_dir() {
        let mut config = PipelineConfig::new();
        config.dependencies_installed = true;
        let err = config.require(ReadinessMode::Image).unwrap_err();
        assert_eq!(err.to_string(), "image refused: missing cloneDir");
    }

    #[test]
    fn serialize_is_stable_and_parse_reads_it_back() {
        let config = ready_for_iso();
        let text = config.serialize();
        assert!(text.starts_with("isoTag=2025\nisoName=demo.iso\n"));
        assert!(text.contains("dependenciesInstalled=1\n"));
        assert!(text.contains("bootTextEdited=0\n"));
        assert_eq!(PipelineConfig::parse(&text), config);
    }

    #[test]
    fn legacy_keys_are_accepted() {
        let config = PipelineConfig::parse(
            "vmlinuzPath=/boot/vmlinuz-linux\nmkinitcpioGenerated=1\ngrubEdited=1\ncalamaresBrandingEdited=1\n",
        );
        assert_eq!(config.kernel_image_path, "/boot/vmlinuz-linux");
        assert!(config.initramfs_generated);
        assert!(config.boot_config_edited);
        assert!(config.branding_edited);
    }

    #[test]
    fn unknown_keys_and_junk_are_ignored() {
        let config = PipelineConfig::parse("favouriteColour=blue\nnot a pair\nisoTag=x\n");
        assert_eq!(config.iso_tag, "x");
        assert_eq!(config.editor(), DEFAULT_EDITOR);
    }

    #[test]
    fn set_rejects_bad_input() {
        let mut config = PipelineConfig::new();
        assert!(config.set(ConfigKey::IsoName, "   ").is_err());
        assert!(config.set(ConfigKey::IsoTag, "my tag").is_err());
        assert!(config.set(ConfigKey::BootTextEdited, "yes").is_err());
        config.set(ConfigKey::BootTextEdited, "1").unwrap();
        assert!(config.boot_text_edited);
    }

    #[test]
    fn file_store_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let store = FileConfigStore::new(dir.path().join("nested/configuration.txt"));
        assert_eq!(store.load().unwrap(), PipelineConfig::new());
    }

    #[test]
    fn file_store_persists_across_loads() {
        let dir = TempDir::new().unwrap();
        let store = FileConfigStore::new(dir.path().join("nested/configuration.txt"));
        let mut config = store.load().unwrap();
        config.set(ConfigKey::CloneDir, "/home/demo/arch").unwrap();
        store.save(&config).unwrap();

        let reloaded = FileConfigStore::new(store.path()).load().unwrap();
        assert_eq!(reloaded.clone_dir, "/home/demo/arch");
    }

    #[test]
    fn memory_store_counts_saves() {
        let store = MemoryStore::new();
        store.save(&PipelineConfig::new()).unwrap();
        store.save(&PipelineConfig::new()).unwrap();
        assert_eq!(store.save_count(), 2);
    }
}
