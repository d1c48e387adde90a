//! The pipeline session.
//!
//! A [`Session`] owns the loaded configuration and the injected store,
//! runner, profile and operator. Every operation the CLI exposes is a
//! method here. Stage operations are wrapped in a run record and every
//! configuration mutation is saved before the method returns, so an
//! interrupted session resumes from the persisted flags.

use anyhow::{Context, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::artifact::block_image::{self, FsKind, IMAGE_MOUNT_POINT, IMAGE_NAME};
use crate::artifact::squashfs::{self, Codec};
use crate::artifact::{checksum, iso};
use crate::boot::{self, BootConfigKind, BootProgress};
use crate::clone::{self, ExcludeRules, TEMP_MOUNT_POINT};
use crate::config::{ConfigKey, ConfigStore, PipelineConfig, ReadinessMode};
use crate::disk::layout::{self, DiskLayout};
use crate::disk::plan::ProvisionPlan;
use crate::disk::{DiskProvisioner, FsProbe, NodeProbe, TARGET_ROOT};
use crate::error::StageError;
use crate::media::{self, BlockDevice};
use crate::operator::Operator;
use crate::preflight;
use crate::process::Runner;
use crate::profile::DistroProfile;
use crate::qemu;
use crate::runs::{self, RunMetadata, RunRecord, KEEP_RUNS};

const RUNS_DIR: &str = "runs";
const BOOT_DIR: &str = "/boot";
const RECENT_RUNS: usize = 5;

/// Where a clone reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloneSource {
    /// The running system.
    Live,
    /// The running system with `/usr` copied in a second pass.
    LiveTwoPhase,
    /// Another drive, mounted temporarily if needed.
    Device(PathBuf),
    /// One folder or file, copied into `home/userfiles`.
    Path(PathBuf),
}

/// What a stage leaves behind, for its run record.
pub trait StageOutput {
    fn artifact(&self) -> Option<&Path>;
}

impl StageOutput for () {
    fn artifact(&self) -> Option<&Path> {
        None
    }
}

impl StageOutput for PathBuf {
    fn artifact(&self) -> Option<&Path> {
        Some(self)
    }
}

pub struct Session<'a> {
    runner: &'a dyn Runner,
    store: Box<dyn ConfigStore>,
    config: PipelineConfig,
    profile: DistroProfile,
    operator: Operator,
    state_dir: PathBuf,
    boot_dir: PathBuf,
    source_root: PathBuf,
    preflight: bool,
}

impl<'a> Session<'a> {
    /// Load the configuration from `store` and set up a session.
    pub fn open(
        runner: &'a dyn Runner,
        store: Box<dyn ConfigStore>,
        profile: DistroProfile,
        operator: Operator,
    ) -> Result<Self> {
        let config = store.load()?;
        let state_dir = operator.state_dir();
        debug!(profile = profile.name(), state_dir = %state_dir.display(), "session opened");
        Ok(Self {
            runner,
            store,
            config,
            profile,
            operator,
            state_dir,
            boot_dir: PathBuf::from(BOOT_DIR),
            source_root: PathBuf::from("/"),
            preflight: true,
        })
    }

    /// Read kernels from `dir` instead of `/boot`.
    pub fn with_boot_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.boot_dir = dir.into();
        self
    }

    /// Clone from `root` instead of `/`.
    pub fn with_source_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.source_root = root.into();
        self
    }

    /// Do not check host tools before stages.
    pub fn skip_preflight(mut self) -> Self {
        self.preflight = false;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn profile(&self) -> &DistroProfile {
        &self.profile
    }

    pub fn operator(&self) -> &Operator {
        &self.operator
    }

    pub fn build_root(&self) -> PathBuf {
        self.profile.build_root(&self.state_dir)
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.state_dir.join(RUNS_DIR)
    }

    fn save(&self) -> Result<()> {
        self.store.save(&self.config)
    }

    fn check_tools(&self, tools: &[(&str, &str)]) -> Result<()> {
        if self.preflight {
            preflight::check_required_tools(tools)?;
        }
        Ok(())
    }

    fn clone_dir(&self) -> Result<PathBuf, StageError> {
        if self.config.clone_dir.is_empty() {
            return Err(StageError::precondition(
                "clone",
                vec![ConfigKey::CloneDir.name().to_string()],
            ));
        }
        Ok(PathBuf::from(&self.config.clone_dir))
    }

    /// Block images go to `outputDir`, or next to the staging tree.
    fn block_image_dir(&self) -> Result<PathBuf, StageError> {
        if self.config.output_dir.is_empty() {
            self.clone_dir()
        } else {
            Ok(PathBuf::from(&self.config.output_dir))
        }
    }

    fn recorded<T: StageOutput>(
        &mut self,
        stage: &str,
        op: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        let runs_dir = self.runs_dir();
        let record = RunRecord::start(&runs_dir, stage)?;
        debug!(stage, run_id = record.run_id(), "stage started");

        let result = op(self);
        match &result {
            Ok(output) => {
                record.succeed(output.artifact())?;
            }
            Err(err) => {
                if let Err(record_err) = record.fail(err) {
                    warn!(stage, error = %record_err, "could not record failed run");
                }
            }
        }
        if let Err(err) = runs::prune_old_runs(&runs_dir, KEEP_RUNS) {
            warn!(error = %err, "could not prune old run records");
        }
        result
    }

    /// Install the profile's package manifest.
    pub fn install_dependencies(&mut self) -> Result<()> {
        self.recorded("deps", |s| {
            println!("=== Installing dependencies for {} ===\n", s.profile.name());
            s.runner.run(&s.profile.install_command())?;
            s.config.dependencies_installed = true;
            s.save()
        })
    }

    /// Set `key` (current or legacy name) to `value` and save.
    pub fn set_value(&mut self, key: &str, value: &str) -> Result<()> {
        let key = ConfigKey::parse(key)
            .ok_or_else(|| StageError::invalid_input("key", format!("unknown key '{}'", key)))?;
        self.config.set(key, value)?;
        info!(key = key.name(), "configuration updated");
        self.save()
    }

    pub fn kernels(&self) -> Result<Vec<PathBuf>> {
        boot::list_kernels(&self.boot_dir)
    }

    /// Select the `index`th kernel (1-based) of [`Session::kernels`].
    pub fn select_kernel(&mut self, index: usize) -> Result<PathBuf> {
        let kernels = self.kernels()?;
        let candidate = index
            .checked_sub(1)
            .and_then(|i| kernels.get(i))
            .ok_or_else(|| {
                StageError::invalid_input(
                    "kernel",
                    format!("choose 1-{}, got {}", kernels.len(), index),
                )
            })?;
        let build_root = self.build_root();
        let dest = boot::select_kernel(&mut self.config, &self.profile, &build_root, candidate)?;
        self.save()?;
        Ok(dest)
    }

    pub fn generate_initramfs(&mut self) -> Result<PathBuf> {
        self.recorded("initramfs", |s| {
            let build_root = s.build_root();
            let output =
                boot::generate_initramfs(s.runner, &mut s.config, &s.profile, &build_root)?;
            s.save()?;
            Ok(output)
        })
    }

    /// Open a boot configuration file in the editor and mark it edited.
    pub fn edit(&mut self, kind: BootConfigKind) -> Result<PathBuf> {
        let build_root = self.build_root();
        let path = boot::expose_boot_config(
            self.runner,
            &mut self.config,
            &self.profile,
            &build_root,
            kind,
        )?;
        self.save()?;
        Ok(path)
    }

    /// Fill the staging tree under `cloneDir`.
    pub fn clone(&mut self, source: CloneSource) -> Result<PathBuf> {
        self.recorded("clone", |s| {
            s.config.require(ReadinessMode::Image)?;
            s.check_tools(preflight::IMAGE_TOOLS)?;
            let clone_dir = s.clone_dir()?;
            let staging = clone::staging_dir(&clone_dir);

            match source {
                CloneSource::Live => {
                    let rules = ExcludeRules::system(&s.source_root, &staging);
                    clone::clone(s.runner, &s.source_root, &staging, &rules)?;
                }
                CloneSource::LiveTwoPhase => {
                    let rules = ExcludeRules::system(&s.source_root, &staging);
                    clone::clone_two_phase(s.runner, &s.source_root, &staging, &rules)?;
                }
                CloneSource::Device(device) => {
                    let rules = ExcludeRules::system(Path::new(TEMP_MOUNT_POINT), &staging);
                    let mounts = clone::read_mount_table()?;
                    clone::clone_device(
                        s.runner,
                        &device,
                        Path::new(TEMP_MOUNT_POINT),
                        &mounts,
                        &staging,
                        &rules,
                    )?;
                }
                CloneSource::Path(path) => {
                    return clone::clone_path(s.runner, &path, &clone_dir);
                }
            }
            Ok(staging)
        })
    }

    /// Package the staging tree into the build tree's squashfs.
    pub fn build_image(&mut self, codec: Codec) -> Result<PathBuf> {
        self.recorded("image", |s| {
            s.config.require(ReadinessMode::Image)?;
            s.check_tools(preflight::IMAGE_TOOLS)?;
            let staging = clone::staging_dir(&s.clone_dir()?);
            let output = s.build_root().join(s.profile.squashfs_path);

            println!("=== Building root image ===\n");
            let rules = ExcludeRules::system(&staging, &staging);
            squashfs::package_directory(s.runner, &staging, &output, codec, &rules)?;
            checksum::checksum(&output)?;
            println!("\n=== Image ready: {} ===", output.display());
            Ok(output)
        })
    }

    /// Build a `size_bytes` block image from the staging tree.
    pub fn build_block_image(&mut self, size_bytes: u64, fs_kind: FsKind) -> Result<PathBuf> {
        self.recorded("block-image", |s| {
            s.config.require(ReadinessMode::Image)?;
            s.check_tools(&preflight::block_image_tools(fs_kind))?;
            let staging = clone::staging_dir(&s.clone_dir()?);
            let staging = staging.is_dir().then_some(staging);
            if staging.is_none() {
                warn!("no staging tree, the image will be empty");
            }
            let output_dir = s.block_image_dir()?;

            println!("=== Building {} block image ===\n", fs_kind);
            let image = block_image::package_block_image(
                s.runner,
                &output_dir,
                size_bytes,
                fs_kind,
                staging.as_deref(),
                Path::new(IMAGE_MOUNT_POINT),
            )?;
            let sidecar = checksum::checksum(&image)?;
            s.operator.chown(&image)?;
            s.operator.chown(&sidecar)?;
            Ok(image)
        })
    }

    /// Assemble the hybrid ISO into `outputDir`.
    pub fn build_iso(&mut self) -> Result<PathBuf> {
        self.recorded("iso", |s| {
            s.config.require(ReadinessMode::Iso)?;
            s.check_tools(preflight::ISO_TOOLS)?;
            let build_root = s.build_root();
            iso::assemble(
                s.runner,
                &s.config,
                &s.profile,
                &build_root,
                &s.operator,
                iso::now(),
            )
        })
    }

    pub fn removable_targets(&self) -> Result<Vec<BlockDevice>> {
        media::list_removable_targets()
    }

    /// Finished ISOs in `outputDir`.
    pub fn isos(&self) -> Result<Vec<PathBuf>> {
        if self.config.output_dir.is_empty() {
            return Ok(Vec::new());
        }
        media::list_isos(Path::new(&self.config.output_dir))
    }

    /// Raw-copy `iso` onto `device`. The caller confirms first.
    pub fn write(&mut self, iso: &Path, device: &Path) -> Result<()> {
        self.recorded("write", |s| {
            s.check_tools(preflight::MEDIA_TOOLS)?;
            media::write_iso(s.runner, iso, device)
        })
    }

    /// Boot `iso`, or the newest ISO in `outputDir`, in QEMU.
    pub fn test_iso(&mut self, iso: Option<&Path>, uefi: bool) -> Result<PathBuf> {
        self.recorded("test-iso", |s| {
            s.check_tools(preflight::QEMU_TOOLS)?;
            let iso = match iso {
                Some(path) => path.to_path_buf(),
                None => qemu::newest(&s.isos()?).ok_or_else(|| {
                    StageError::precondition("test-iso", vec!["an ISO in outputDir".to_string()])
                })?,
            };
            let ovmf = if uefi {
                let found = qemu::find_ovmf();
                if found.is_none() {
                    warn!("no OVMF firmware found, booting with BIOS");
                }
                found
            } else {
                None
            };
            let kvm = Path::new("/dev/kvm").exists();
            qemu::boot_iso(s.runner, &iso, ovmf.as_deref(), kvm)?;
            Ok(iso)
        })
    }

    /// Partition `device` and install onto it. The caller confirms first.
    pub fn install(&mut self, device: &Path, fs_kind: FsKind, plan: Option<&Path>) -> Result<()> {
        let plan = match plan {
            Some(path) => ProvisionPlan::load(path, &self.profile)?,
            None => ProvisionPlan::defaults(&self.profile),
        };
        let size = layout::device_size_bytes(device)
            .with_context(|| format!("sizing {}", device.display()))?;
        let layout = DiskLayout::plan(device, size, fs_kind)?;
        self.provision_disk(layout, &plan, &FsProbe, Path::new(TARGET_ROOT))
    }

    /// Run every provisioning step for `layout` with the target at `target`.
    pub fn provision_disk(
        &mut self,
        layout: DiskLayout,
        plan: &ProvisionPlan,
        probe: &dyn NodeProbe,
        target: &Path,
    ) -> Result<()> {
        self.recorded("install", |s| {
            s.check_tools(&preflight::install_tools(&s.profile, layout.fs_kind, plan))?;
            println!(
                "=== Installing {} onto {} ({}) ===\n",
                s.profile.name(),
                layout.device.display(),
                layout.fs_kind
            );
            let mut provisioner = DiskProvisioner::new(s.runner, probe, layout, target);
            provisioner.run_all(plan, &s.profile)
        })
    }

    /// Remove the staging tree and the block image built from it.
    pub fn delete_staging(&mut self) -> Result<()> {
        self.recorded("delete", |s| {
            let staging = clone::staging_dir(&s.clone_dir()?);
            let image = s.block_image_dir()?.join(IMAGE_NAME);
            clone::delete_staging(s.runner, &staging, Some(&image))
        })
    }

    pub fn status(&self) -> Result<StatusReport> {
        Ok(StatusReport {
            profile: self.profile.name(),
            values: ConfigKey::ALL
                .iter()
                .map(|key| (*key, self.config.value_of(*key)))
                .collect(),
            iso_missing: self.config.missing(ReadinessMode::Iso),
            image_missing: self.config.missing(ReadinessMode::Image),
            boot: BootProgress::of(&self.config),
            recent_runs: runs::latest_runs(&self.runs_dir(), RECENT_RUNS)?,
        })
    }
}

/// Configuration checklist and recent runs.
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub profile: &'static str,
    pub values: Vec<(ConfigKey, String)>,
    pub iso_missing: Vec<String>,
    pub image_missing: Vec<String>,
    pub boot: BootProgress,
    pub recent_runs: Vec<RunMetadata>,
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Profile: {}", self.profile)?;
        writeln!(f)?;
        for (key, value) in &self.values {
            let mark = if key.is_flag() {
                if value == "1" { "[x]" } else { "[ ]" }
            } else if value.is_empty() {
                "[ ]"
            } else {
                "[x]"
            };
            if key.is_flag() || value.is_empty() {
                writeln!(f, "  {} {}", mark, key.name())?;
            } else {
                writeln!(f, "  {} {} = {}", mark, key.name(), value)?;
            }
        }
        writeln!(f)?;
        writeln!(f, "Boot: {:?}", self.boot)?;
        for (label, missing) in [("ISO", &self.iso_missing), ("Image", &self.image_missing)] {
            if missing.is_empty() {
                writeln!(f, "{}: ready", label)?;
            } else {
                writeln!(f, "{}: missing {}", label, missing.join(", "))?;
            }
        }
        if !self.recent_runs.is_empty() {
            writeln!(f)?;
            writeln!(f, "Recent runs:")?;
            for run in &self.recent_runs {
                let when = run
                    .finished_at_utc
                    .as_deref()
                    .unwrap_or(run.created_at_utc.as_str());
                write!(f, "  {} {:<12} {:?}", when, run.stage, run.status)?;
                if let Some(artifact) = &run.artifact {
                    write!(f, " {}", artifact)?;
                }
                writeln!(f)?;
            }
        }
        Ok(())
    }
}
