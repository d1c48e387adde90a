//! SHA-512 sidecar files.
//!
//! Format is the one `sha512sum -c` expects: `"<hash>  <filename>"` with two
//! spaces and just the file name, so users can verify with
//! `cd output && sha512sum -c distro.iso.sha512`.

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha512};
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

const SEPARATOR: &str = "  ";

/// `<path>.sha512`
pub fn sidecar_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".sha512");
    PathBuf::from(name)
}

/// Hex SHA-512 of a file's contents.
pub fn sha512_hex(path: &Path) -> Result<String> {
    let file = File::open(path).with_context(|| format!("opening '{}'", path.display()))?;
    let mut reader = BufReader::with_capacity(1 << 20, file);
    let mut hasher = Sha512::new();
    let mut buf = vec![0u8; 1 << 20];
    loop {
        let n = reader
            .read(&mut buf)
            .with_context(|| format!("reading '{}'", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect())
}

/// Write `<path>.sha512` and return its location.
pub fn checksum(path: &Path) -> Result<PathBuf> {
    let hash = sha512_hex(path)?;
    let filename = path
        .file_name()
        .context("Could not get file name for checksum")?
        .to_string_lossy();

    let sidecar = sidecar_path(path);
    fs::write(&sidecar, format!("{}{}{}\n", hash, SEPARATOR, filename))
        .with_context(|| format!("writing '{}'", sidecar.display()))?;

    println!("  SHA512: {}...{}", &hash[..8], &hash[hash.len() - 8..]);
    println!("  Wrote: {}", sidecar.display());
    Ok(sidecar)
}

/// Recompute the hash of `path` and compare it with its sidecar.
pub fn verify_checksum(path: &Path) -> Result<bool> {
    let sidecar = sidecar_path(path);
    let text = fs::read_to_string(&sidecar)
        .with_context(|| format!("reading '{}'", sidecar.display()))?;
    let Some((expected, name)) = text.trim_end().split_once(SEPARATOR) else {
        bail!("Malformed checksum file: {}", sidecar.display());
    };
    let actual_name = path.file_name().map(|n| n.to_string_lossy().into_owned());
    if actual_name.as_deref() != Some(name) {
        bail!(
            "Checksum file {} names '{}', not '{}'",
            sidecar.display(),
            name,
            path.display()
        );
    }
    Ok(sha512_hex(path)? == expected)
}
