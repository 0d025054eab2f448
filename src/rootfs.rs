//! File operations on the mounted root filesystem.
//!
//! Paths are relative to the root (`etc/hostname`, not `/etc/hostname`).

use anyhow::{Context, Result};
use std::fs;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::io::Write;
use std::path::Path;

/// Where packaged systemd units live inside the image.
const UNIT_DIR: &str = "/usr/lib/systemd/system";

/// Write a file, creating parent directories.
pub fn write_file(root: &Path, path: &str, content: &str) -> Result<()> {
    let full_path = root.join(path);
    if let Some(parent) = full_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&full_path, content)
        .with_context(|| format!("writing {}", full_path.display()))?;
    Ok(())
}

/// Write a file that is created with `mode` rather than narrowed after the
/// fact, so secrets are never readable by others.
pub fn write_file_mode(root: &Path, path: &str, content: &str, mode: u32) -> Result<()> {
    let full_path = root.join(path);
    if let Some(parent) = full_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(&full_path)
        .with_context(|| format!("creating {}", full_path.display()))?;
    file.write_all(content.as_bytes())?;
    // An existing file keeps its old mode through open(2).
    fs::set_permissions(&full_path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

/// Create a directory with the given mode.
pub fn create_dir_mode(root: &Path, path: &str, mode: u32) -> Result<()> {
    let full_path = root.join(path);
    fs::create_dir_all(&full_path)
        .with_context(|| format!("creating {}", full_path.display()))?;
    fs::set_permissions(&full_path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

/// Create a symlink, replacing whatever is at `link`.
pub fn symlink(root: &Path, link: &str, target: &str) -> Result<()> {
    let link_path = root.join(link);
    if let Some(parent) = link_path.parent() {
        fs::create_dir_all(parent)?;
    }
    if link_path.is_symlink() || link_path.exists() {
        fs::remove_file(&link_path)?;
    }
    std::os::unix::fs::symlink(target, &link_path)
        .with_context(|| format!("linking {} -> {}", link_path.display(), target))?;
    Ok(())
}

/// Append `line` unless the file already has it.
pub fn ensure_line(root: &Path, path: &str, line: &str) -> Result<()> {
    let full_path = root.join(path);
    let existing = match fs::read_to_string(&full_path) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e).with_context(|| format!("reading {}", full_path.display())),
    };
    if existing.lines().any(|l| l.trim() == line) {
        return Ok(());
    }
    let mut content = existing;
    if !content.is_empty() && !content.ends_with('\n') {
        content.push('\n');
    }
    content.push_str(line);
    content.push('\n');
    write_file(root, path, &content)
}

/// Enable a systemd unit the way `systemctl enable` would, without running
/// anything inside the image.
///
/// Creates `etc/systemd/system/<target>.wants/<unit>` pointing at the
/// packaged unit file. Template instances (`name@inst.service`) link to the
/// template (`name@.service`).
pub fn enable_unit(root: &Path, unit: &str, wanted_by: &str) -> Result<()> {
    let wants = format!("etc/systemd/system/{}.wants/{}", wanted_by, unit);
    let link_path = root.join(&wants);
    if link_path.is_symlink() {
        return Ok(());
    }
    symlink(root, &wants, &format!("{}/{}", UNIT_DIR, unit_file(unit)))
}

fn unit_file(unit: &str) -> String {
    match unit.split_once('@') {
        Some((name, instance)) => match instance.rsplit_once('.') {
            Some((_, kind)) => format!("{}@.{}", name, kind),
            None => unit.to_string(),
        },
        None => unit.to_string(),
    }
}
