//! Base system, packages and boot wiring.

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use log::info;
use std::fs::{self, File};
use std::io::BufReader;

use super::StageContext;
use crate::chroot::{emulation, ChrootCommand};
use crate::device::layout::{BOOT_LABEL, ROOT_LABEL};
use crate::packages::KernelSet;
use crate::rootfs;

pub(super) fn extract_base(ctx: &StageContext<'_>) -> Result<()> {
    let file = File::open(ctx.archive)
        .with_context(|| format!("Failed to open {}", ctx.archive.display()))?;
    let mut archive = tar::Archive::new(GzDecoder::new(BufReader::new(file)));
    archive.set_preserve_permissions(true);
    archive.set_preserve_ownerships(true);
    archive.set_preserve_mtime(true);
    archive.set_overwrite(true);
    archive
        .unpack(ctx.root)
        .with_context(|| format!("Failed to unpack {}", ctx.archive.display()))?;
    info!("extracted {} into {}", ctx.archive.display(), ctx.root.display());
    Ok(())
}

pub(super) fn native_host(ctx: &StageContext<'_>) -> Option<String> {
    if ctx.config.emulation.required {
        None
    } else {
        Some("host executes aarch64 natively".into())
    }
}

pub(super) fn install_emulation(ctx: &StageContext<'_>) -> Result<()> {
    emulation::install(ctx.root, &ctx.config.emulation)
}

pub(super) fn remove_emulation(ctx: &StageContext<'_>) -> Result<()> {
    emulation::remove(ctx.root, &ctx.config.emulation)
}

pub(super) fn package_keyring(ctx: &StageContext<'_>) -> Result<()> {
    ctx.chroot
        .run(&ChrootCommand::new("pacman-key").arg("--init"))?;
    ctx.chroot
        .run(&ChrootCommand::new("pacman-key").args(["--populate", "archlinuxarm"]))?;
    ctx.packages.refresh(&ctx.chroot)?;
    Ok(())
}

pub(super) fn kernel_firmware(ctx: &StageContext<'_>) -> Result<()> {
    let set = KernelSet::for_model(ctx.config.model);
    info!(
        "installing kernel for Raspberry Pi {}: {}",
        ctx.config.model,
        set.packages.join(" ")
    );
    set.install(ctx.packages, &ctx.chroot)?;
    Ok(())
}

pub(super) fn no_extra_packages(ctx: &StageContext<'_>) -> Option<String> {
    ctx.config
        .packages
        .is_empty()
        .then(|| "no extra packages configured".into())
}

pub(super) fn extra_packages(ctx: &StageContext<'_>) -> Result<()> {
    ctx.packages.install(&ctx.chroot, &ctx.config.packages)?;
    Ok(())
}

/// Mount boot by label and point the kernel at the root label, so the
/// image boots the same from SD card or USB.
pub(super) fn fstab(ctx: &StageContext<'_>) -> Result<()> {
    let path = ctx.root.join("etc/fstab");
    let existing = fs::read_to_string(&path).unwrap_or_default();
    let mut content: String = existing
        .lines()
        .filter(|line| line.split_whitespace().nth(1) != Some("/boot"))
        .map(|line| format!("{}\n", line))
        .collect();
    content.push_str(&format!(
        "LABEL={}  /boot  vfat  defaults  0  2\n",
        BOOT_LABEL
    ));
    rootfs::write_file(ctx.root, "etc/fstab", &content)?;

    let cmdline = ctx.root.join("boot/cmdline.txt");
    if cmdline.exists() {
        let current = fs::read_to_string(&cmdline)
            .with_context(|| format!("reading {}", cmdline.display()))?;
        let root_arg = format!("root=LABEL={}", ROOT_LABEL);
        let mut args: Vec<String> = current
            .split_whitespace()
            .map(|arg| {
                if arg.starts_with("root=") {
                    root_arg.clone()
                } else {
                    arg.to_string()
                }
            })
            .collect();
        if !args.contains(&root_arg) {
            args.insert(0, root_arg);
        }
        rootfs::write_file(ctx.root, "boot/cmdline.txt", &format!("{}\n", args.join(" ")))?;
    }
    Ok(())
}

pub(super) fn system_update(ctx: &StageContext<'_>) -> Result<()> {
    ctx.packages.upgrade(&ctx.chroot)?;
    Ok(())
}
