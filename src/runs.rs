//! Stage run records.
//!
//! Every stage invocation writes `<runs>/<run_id>/run-manifest.json` when it
//! starts and rewrites it when it finishes. Run ids sort by creation time,
//! so the status report can show the most recent runs without parsing
//! timestamps.

use std::cmp::Reverse;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

const RUN_MANIFEST_FILENAME: &str = "run-manifest.json";
const RUN_ID_SALT_BITS: u32 = 32;
static RUN_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Runs kept per state directory.
pub const KEEP_RUNS: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub run_id: String,
    pub stage: String,
    pub status: RunStatus,
    pub created_at_utc: String,
    pub finished_at_utc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub fn manifest_path(run_dir: &Path) -> PathBuf {
    run_dir.join(RUN_MANIFEST_FILENAME)
}

fn utc_now() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .context("formatting run timestamp")
}

/// An in-progress run. Finish it with [`RunRecord::succeed`] or
/// [`RunRecord::fail`].
#[derive(Debug)]
pub struct RunRecord {
    dir: PathBuf,
    meta: RunMetadata,
}

impl RunRecord {
    pub fn start(runs_root: &Path, stage: &str) -> Result<Self> {
        let run_id = generate_run_id()?;
        let dir = runs_root.join(&run_id);
        fs::create_dir_all(&dir)
            .with_context(|| format!("creating run directory '{}'", dir.display()))?;
        let record = Self {
            dir,
            meta: RunMetadata {
                run_id,
                stage: stage.to_string(),
                status: RunStatus::Running,
                created_at_utc: utc_now()?,
                finished_at_utc: None,
                artifact: None,
                error: None,
            },
        };
        record.write()?;
        Ok(record)
    }

    pub fn run_id(&self) -> &str {
        &self.meta.run_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn succeed(mut self, artifact: Option<&Path>) -> Result<RunMetadata> {
        self.meta.status = RunStatus::Success;
        self.meta.artifact = artifact.map(|p| p.display().to_string());
        self.finish()
    }

    pub fn fail(mut self, error: &anyhow::Error) -> Result<RunMetadata> {
        self.meta.status = RunStatus::Failed;
        self.meta.error = Some(format!("{:#}", error));
        self.finish()
    }

    fn finish(mut self) -> Result<RunMetadata> {
        self.meta.finished_at_utc = Some(utc_now()?);
        self.write()?;
        Ok(self.meta)
    }

    fn write(&self) -> Result<()> {
        let path = manifest_path(&self.dir);
        let bytes = serde_json::to_vec_pretty(&self.meta)
            .with_context(|| format!("serializing run metadata '{}'", path.display()))?;
        fs::write(&path, bytes)
            .with_context(|| format!("writing run metadata '{}'", path.display()))
    }
}

pub fn load_runs_metadata(runs_root: &Path) -> Result<Vec<RunMetadata>> {
    if !runs_root.is_dir() {
        return Ok(Vec::new());
    }
    let mut runs = Vec::new();
    for entry in fs::read_dir(runs_root)
        .with_context(|| format!("reading runs directory '{}'", runs_root.display()))?
    {
        let entry = entry
            .with_context(|| format!("iterating runs directory '{}'", runs_root.display()))?;
        let run_dir = entry.path();
        if !run_dir.is_dir() {
            continue;
        }
        let Some(run_name) = run_dir.file_name().and_then(|part| part.to_str()) else {
            continue;
        };
        if run_name.starts_with('.') {
            continue;
        }
        let path = manifest_path(&run_dir);
        if !path.is_file() {
            continue;
        }
        let bytes = fs::read(&path)
            .with_context(|| format!("reading run metadata '{}'", path.display()))?;
        let parsed: RunMetadata = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing run metadata '{}'", path.display()))?;
        runs.push(parsed);
    }
    Ok(runs)
}

/// Newest first.
pub fn latest_runs(runs_root: &Path, limit: usize) -> Result<Vec<RunMetadata>> {
    let mut runs = load_runs_metadata(runs_root)?;
    runs.sort_by_key(|run| Reverse(run_sort_key(run)));
    runs.truncate(limit);
    Ok(runs)
}

pub fn latest_successful(runs_root: &Path, stage: &str) -> Result<Option<RunMetadata>> {
    let mut runs = load_runs_metadata(runs_root)?;
    runs.retain(|run| run.status == RunStatus::Success && run.stage == stage);
    runs.sort_by_key(|run| Reverse(run_sort_key(run)));
    Ok(runs.into_iter().next())
}

pub fn prune_old_runs(runs_root: &Path, keep: usize) -> Result<()> {
    let mut runs = load_runs_metadata(runs_root)?;
    runs.sort_by_key(|run| Reverse(run_sort_key(run)));
    for run in runs.into_iter().skip(keep) {
        let path = runs_root.join(&run.run_id);
        fs::remove_dir_all(&path)
            .with_context(|| format!("removing expired run directory '{}'", path.display()))?;
    }
    Ok(())
}

fn run_sort_key(run: &RunMetadata) -> (String, String) {
    (
        run.finished_at_utc
            .clone()
            .unwrap_or_else(|| run.created_at_utc.clone()),
        run.run_id.clone(),
    )
}

pub fn generate_run_id() -> Result<String> {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock before UNIX_EPOCH while generating run id")?
        .as_nanos();
    let pid_component = (std::process::id() as u128 & 0xFFFF) << 16;
    let seq_component = (RUN_ID_COUNTER.fetch_add(1, Ordering::Relaxed) as u128) & 0xFFFF;
    let entropy = (nanos << RUN_ID_SALT_BITS) | pid_component | seq_component;
    let suffix = base62_encode_u128(entropy);
    if suffix.len() > 22 {
        bail!("sortable run id overflow while generating run identifier")
    }
    Ok(format!("{:0>22}", suffix))
}

fn base62_encode_u128(mut value: u128) -> String {
    const ALPHABET: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut bytes = Vec::new();
    while value > 0 {
        let idx = (value % 62) as usize;
        bytes.push(ALPHABET[idx] as char);
        value /= 62;
    }
    bytes.iter().rev().collect()
}
