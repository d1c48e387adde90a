//! External process execution.
//!
//! Every mutation the pipeline performs on the host goes through a [`Cmd`]
//! handed to a [`Runner`]. Commands are built from a program and an argv
//! vector; nothing is ever passed through a shell.
//!
//! ```rust,ignore
//! use live_builder::process::{Cmd, Runner, SystemRunner};
//!
//! SystemRunner.run(
//!     &Cmd::new("mksquashfs")
//!         .arg_path(staging)
//!         .arg_path(output)
//!         .args(["-comp", "xz"])
//!         .error_msg("mksquashfs failed. Install squashfs-tools."),
//! )?;
//! ```
//!
//! `run` inherits stdio so tool output streams live. `capture` is for
//! read-only probes whose stdout we need to parse.

use anyhow::{Context, Result};
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use tracing::{debug, warn};

use crate::error::StageError;

/// A single external command invocation.
#[derive(Debug, Clone)]
pub struct Cmd {
    program: String,
    args: Vec<OsString>,
    cwd: Option<PathBuf>,
    error_msg: Option<String>,
    allow_fail: bool,
    tolerated_codes: Vec<i32>,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            error_msg: None,
            allow_fail: false,
            tolerated_codes: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn arg_path(self, path: &Path) -> Self {
        self.arg(path.as_os_str())
    }

    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.cwd = Some(dir.to_path_buf());
        self
    }

    /// Hint printed under the failure banner.
    pub fn error_msg(mut self, msg: impl Into<String>) -> Self {
        self.error_msg = Some(msg.into());
        self
    }

    /// Non-zero exit only logs a warning.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    /// Exit codes treated as success with a warning (e.g. rsync 23/24).
    pub fn tolerate_codes(mut self, codes: &[i32]) -> Self {
        self.tolerated_codes.extend_from_slice(codes);
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn argv(&self) -> &[OsString] {
        &self.args
    }

    pub fn is_allow_fail(&self) -> bool {
        self.allow_fail
    }

    fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }
        command
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            let arg = arg.to_string_lossy();
            let plain = !arg.is_empty()
                && arg
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@%+^".contains(c));
            if plain {
                write!(f, " {}", arg)?;
            } else {
                write!(f, " '{}'", arg.replace('\'', r"'\''"))?;
            }
        }
        Ok(())
    }
}

/// Outcome of a command that did not abort the pipeline.
#[derive(Debug, Clone, Default)]
pub struct CmdResult {
    /// Exit code, `None` if the process was killed or never started.
    pub code: Option<i32>,
    /// Captured stdout (empty for streamed runs).
    pub stdout: String,
}

impl CmdResult {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Executes commands. Injected into every stage.
pub trait Runner {
    /// Run with inherited stdio.
    fn run(&self, cmd: &Cmd) -> Result<CmdResult>;

    /// Run with stdout captured.
    fn capture(&self, cmd: &Cmd) -> Result<CmdResult>;
}

/// Spawns real processes on the host.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl Runner for SystemRunner {
    fn run(&self, cmd: &Cmd) -> Result<CmdResult> {
        debug!(command = %cmd, "spawning");
        let status = match cmd.to_command().status() {
            Ok(status) => status,
            Err(e) => return spawn_failed(cmd, e),
        };
        settle(cmd, exit_code(status), String::new())
    }

    fn capture(&self, cmd: &Cmd) -> Result<CmdResult> {
        debug!(command = %cmd, "spawning (captured)");
        let output = match cmd
            .to_command()
            .stdin(Stdio::null())
            .stderr(Stdio::inherit())
            .output()
        {
            Ok(output) => output,
            Err(e) => return spawn_failed(cmd, e),
        };
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        settle(cmd, exit_code(output.status), stdout)
    }
}

fn exit_code(status: ExitStatus) -> Option<i32> {
    status.code()
}

fn spawn_failed(cmd: &Cmd, e: std::io::Error) -> Result<CmdResult> {
    if cmd.allow_fail {
        warn!(command = %cmd, error = %e, "could not start command, continuing");
        return Ok(CmdResult::default());
    }
    print_failure_banner(cmd);
    Err(e).with_context(|| format!("failed to start '{}'", cmd.program))
}

/// Map an exit code onto the fail-fast / allow-failure policy.
///
/// Shared by every [`Runner`] so recorded and real runs behave the same.
pub fn settle(cmd: &Cmd, code: Option<i32>, stdout: String) -> Result<CmdResult> {
    let result = CmdResult { code, stdout };
    if result.success() {
        return Ok(result);
    }
    if let Some(c) = code {
        if cmd.tolerated_codes.contains(&c) {
            warn!(command = %cmd, code = c, "command finished with tolerated exit code");
            return Ok(result);
        }
    }
    let status = code.map_or_else(|| "killed by signal".to_string(), |c| format!("exit {}", c));
    if cmd.allow_fail {
        warn!(command = %cmd, %status, "command failed, continuing");
        return Ok(result);
    }
    print_failure_banner(cmd);
    Err(StageError::ExternalProcessFailed {
        command: cmd.to_string(),
        status,
    }
    .into())
}

fn print_failure_banner(cmd: &Cmd) {
    eprintln!();
    eprintln!("!!! FAILED: {}", cmd);
    if let Some(msg) = &cmd.error_msg {
        eprintln!("!!! {}", msg);
    }
}
