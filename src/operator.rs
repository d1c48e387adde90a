//! Identity of the person driving the tool.
//!
//! The pipeline runs under `sudo`, but configuration and finished ISOs must
//! belong to the invoking user. The operator is `SUDO_USER` when present,
//! otherwise `USER`, with uid/gid/home read from the passwd database.

use anyhow::{Context, Result};
use std::ffi::{CStr, CString};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Directory under the operator's home holding all persisted state.
pub const STATE_DIR: &str = ".config/live-builder";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operator {
    pub name: String,
    pub home: PathBuf,
    pub uid: u32,
    pub gid: u32,
}

impl Operator {
    /// Resolve from the environment and passwd database.
    pub fn resolve() -> Result<Self> {
        let name = std::env::var("SUDO_USER")
            .ok()
            .filter(|n| !n.is_empty())
            .or_else(|| std::env::var("USER").ok().filter(|n| !n.is_empty()));

        if let Some(name) = name {
            if let Some(op) = lookup_passwd(&name) {
                return Ok(op);
            }
            debug!(user = %name, "user not in passwd database, falling back to current uid");
        }

        let home = dirs::home_dir().context(
            "Could not determine the operator's home directory.\n\
             Set SUDO_USER or USER, or run from a login shell.",
        )?;
        // SAFETY: geteuid/getegid have no preconditions and cannot fail.
        let (uid, gid) = unsafe { (libc::geteuid(), libc::getegid()) };
        Ok(Self {
            name: std::env::var("USER").unwrap_or_else(|_| "root".to_string()),
            home,
            uid,
            gid,
        })
    }

    /// `~/.config/live-builder`
    pub fn state_dir(&self) -> PathBuf {
        self.home.join(STATE_DIR)
    }

    /// Hand `path` to the operator. No-op unless running as root.
    pub fn chown(&self, path: &Path) -> Result<()> {
        if !is_root() {
            return Ok(());
        }
        std::os::unix::fs::chown(path, Some(self.uid), Some(self.gid))
            .with_context(|| format!("Failed to chown {} to {}", path.display(), self.name))
    }
}

/// True when the effective uid is 0.
pub fn is_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

fn lookup_passwd(name: &str) -> Option<Operator> {
    let cname = CString::new(name).ok()?;
    let mut buf: Vec<libc::c_char> = vec![0; 1024];
    loop {
        // SAFETY: all-zero is a valid passwd value; it is only read after
        // getpwnam_r fills it in.
        let mut record: libc::passwd = unsafe { std::mem::zeroed() };
        let mut found: *mut libc::passwd = std::ptr::null_mut();
        // SAFETY: cname is NUL-terminated, buf outlives every pointer the
        // call stores in record, and found is only dereferenced when set.
        let rc = unsafe {
            libc::getpwnam_r(
                cname.as_ptr(),
                &mut record,
                buf.as_mut_ptr(),
                buf.len(),
                &mut found,
            )
        };
        if rc == libc::ERANGE && buf.len() < 1 << 20 {
            buf.resize(buf.len() * 2, 0);
            continue;
        }
        if rc != 0 || found.is_null() {
            return None;
        }
        // SAFETY: pw_dir points into buf, which is still alive.
        let dir = unsafe { CStr::from_ptr(record.pw_dir) }
            .to_string_lossy()
            .into_owned();
        return Some(Operator {
            name: name.to_string(),
            home: PathBuf::from(dir),
            uid: record.pw_uid,
            gid: record.pw_gid,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_is_in_passwd() {
        let op = lookup_passwd("root").unwrap();
        assert_eq!(op.uid, 0);
        assert!(op.home.is_absolute());
    }

    #[test]
    fn unknown_user_is_none() {
        assert!(lookup_passwd("no_such_user_xyz_123").is_none());
    }

    #[test]
    fn state_dir_is_under_home() {
        let op = Operator {
            name: "demo".into(),
            home: PathBuf::from("/home/demo"),
            uid: 1000,
            gid: 1000,
        };
        assert_eq!(
            op.state_dir(),
            PathBuf::from("/home/demo/.config/live-builder")
        );
    }
}
