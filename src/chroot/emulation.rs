//! qemu user-mode interpreter for running aarch64 binaries on other hosts.

use anyhow::{bail, Context, Result};
use log::info;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::config::EmulationConfig;

/// Name of the binfmt_misc entry.
pub const BINFMT_NAME: &str = "qemu-aarch64";

/// ELF header match for little-endian aarch64 executables, in the escaped
/// form binfmt_misc parses.
const AARCH64_MAGIC: &str =
    r"\x7fELF\x02\x01\x01\x00\x00\x00\x00\x00\x00\x00\x00\x00\x02\x00\xb7\x00";
const AARCH64_MASK: &str =
    r"\xff\xff\xff\xff\xff\xff\xff\x00\xff\xff\xff\xff\xff\xff\xff\xff\xfe\xff\xff\xff";

/// Where the interpreter lives inside the root.
pub fn shim_path(root: &Path, emulation: &EmulationConfig) -> Result<PathBuf> {
    let name = emulation
        .interpreter
        .file_name()
        .with_context(|| format!("{} has no file name", emulation.interpreter.display()))?;
    Ok(root.join("usr/bin").join(name))
}

/// Registration line for `<binfmt>/register`.
///
/// The `F` flag makes the kernel open the interpreter at registration time,
/// so `interpreter` is a host path and the entry keeps working from inside
/// a chroot.
pub fn registration_line(interpreter: &Path) -> String {
    format!(
        ":{}:M::{}:{}:{}:F",
        BINFMT_NAME,
        AARCH64_MAGIC,
        AARCH64_MASK,
        interpreter.display()
    )
}

/// Copy the interpreter into the root and register the handler if the host
/// does not already have one.
pub fn install(root: &Path, emulation: &EmulationConfig) -> Result<()> {
    let dest = shim_path(root, emulation)?;
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(&emulation.interpreter, &dest).with_context(|| {
        format!(
            "copying {} into the image",
            emulation.interpreter.display()
        )
    })?;
    fs::set_permissions(&dest, fs::Permissions::from_mode(0o755))?;
    info!("installed {}", dest.display());

    let entry = emulation.binfmt_dir.join(BINFMT_NAME);
    if entry.exists() {
        info!("binfmt handler {} already registered", BINFMT_NAME);
        return Ok(());
    }
    let register = emulation.binfmt_dir.join("register");
    if !register.exists() {
        bail!(
            "{} is not available; mount binfmt_misc first",
            register.display()
        );
    }
    let host_interpreter = fs::canonicalize(&emulation.interpreter)
        .with_context(|| format!("resolving {}", emulation.interpreter.display()))?;
    fs::write(&register, registration_line(&host_interpreter))
        .with_context(|| format!("registering {} handler", BINFMT_NAME))?;
    info!("registered binfmt handler {}", BINFMT_NAME);
    Ok(())
}

/// Remove the interpreter from the image. The host registration stays.
pub fn remove(root: &Path, emulation: &EmulationConfig) -> Result<()> {
    let dest = shim_path(root, emulation)?;
    if dest.exists() {
        fs::remove_file(&dest).with_context(|| format!("removing {}", dest.display()))?;
        info!("removed {}", dest.display());
    }
    Ok(())
}
