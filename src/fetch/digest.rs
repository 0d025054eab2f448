//! SHA-256 digest files and verification.

use anyhow::{bail, Context};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use crate::error::{BuildError, Result};

/// Stream a file through SHA-256. Returns (lowercase hex, size in bytes).
pub fn sha256_file(path: &Path) -> anyhow::Result<(String, u64)> {
    let f = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut r = BufReader::new(f);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    let mut size = 0u64;
    loop {
        let n = r.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((format!("{:x}", hasher.finalize()), size))
}

/// Extract the hex digest from a `sha256sum`-style file.
///
/// Accepts `<hex>` alone or `<hex>  <filename>`; when several lines are
/// present the one naming `file_name` wins.
pub fn parse_digest_file(contents: &str, file_name: &str) -> anyhow::Result<String> {
    let mut first = None;
    for line in contents.lines() {
        let mut parts = line.split_whitespace();
        let Some(hex) = parts.next() else {
            continue;
        };
        let named = parts
            .next()
            .map(|name| name.trim_start_matches('*'))
            .map(|name| name.rsplit('/').next().unwrap_or(name));
        if named == Some(file_name) {
            first = Some(hex);
            break;
        }
        if first.is_none() {
            first = Some(hex);
        }
    }

    let hex = match first {
        Some(hex) => hex.to_ascii_lowercase(),
        None => bail!("digest file is empty"),
    };
    if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        bail!("'{}' is not a SHA-256 digest", hex);
    }
    Ok(hex)
}

/// Compare the file's SHA-256 against the expected digest.
pub fn verify_file(path: &Path, expected: &str) -> Result<()> {
    let (actual, size) = sha256_file(path).map_err(|e| BuildError::Download {
        url: path.display().to_string(),
        source: e,
    })?;
    if !actual.eq_ignore_ascii_case(expected) {
        return Err(BuildError::ChecksumMismatch {
            path: path.to_path_buf(),
            expected: expected.to_ascii_lowercase(),
            actual,
        });
    }
    log::info!("verified {} ({} bytes, sha256 {})", path.display(), size, actual);
    Ok(())
}
