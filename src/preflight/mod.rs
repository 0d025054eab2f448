//! Host checks run before anything is downloaded or allocated.
//!
//! Building an image needs root (loop devices, mounts, chroot) and a fixed
//! set of host tools. On hosts that cannot run aarch64 code natively the
//! static qemu interpreter and binfmt_misc are needed too.

use crate::config::BuildConfig;
use crate::error::{BuildError, Result};

/// Check if a command exists on the host system's PATH.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Required host tools, as (command, package providing it).
pub const REQUIRED_TOOLS: &[(&str, &str)] = &[
    ("losetup", "util-linux"),
    ("partx", "util-linux"),
    ("sfdisk", "util-linux"),
    ("mount", "util-linux"),
    ("umount", "util-linux"),
    ("chroot", "coreutils"),
    ("mkfs.vfat", "dosfstools"),
    ("mkfs.ext4", "e2fsprogs"),
];

/// Check that specific tools are available.
///
/// Every missing tool is listed in one error rather than failing on the
/// first.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<(&str, &str)> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .copied()
        .collect();

    if !missing.is_empty() {
        let what = missing
            .iter()
            .map(|(t, _)| *t)
            .collect::<Vec<_>>()
            .join(", ");
        let mut packages: Vec<&str> = missing.iter().map(|(_, p)| *p).collect();
        packages.sort_unstable();
        packages.dedup();
        return Err(BuildError::DependencyMissing {
            what,
            hint: format!("install: {}", packages.join(" ")),
        });
    }

    Ok(())
}

pub fn check_root() -> Result<()> {
    // SAFETY: geteuid has no preconditions and cannot fail.
    let euid = unsafe { libc::geteuid() };
    if euid != 0 {
        return Err(BuildError::DependencyMissing {
            what: "root privileges".into(),
            hint: "loop devices, mounts and chroot need root; re-run with sudo".into(),
        });
    }
    Ok(())
}

/// Cross-architecture execution support, when the host needs it.
pub fn check_emulation(config: &BuildConfig) -> Result<()> {
    let emulation = &config.emulation;
    if !emulation.required {
        return Ok(());
    }
    if !emulation.interpreter.is_file() {
        return Err(BuildError::DependencyMissing {
            what: emulation.interpreter.display().to_string(),
            hint: "install qemu-user-static (or set RPI_QEMU_STATIC)".into(),
        });
    }
    if !emulation.binfmt_dir.join("register").exists() {
        return Err(BuildError::DependencyMissing {
            what: format!("binfmt_misc at {}", emulation.binfmt_dir.display()),
            hint: "mount it with: mount -t binfmt_misc binfmt_misc /proc/sys/fs/binfmt_misc"
                .into(),
        });
    }
    Ok(())
}

/// Everything a build needs from the host.
pub fn check_host(config: &BuildConfig) -> Result<()> {
    check_root()?;
    check_required_tools(REQUIRED_TOOLS)?;
    check_emulation(config)
}
