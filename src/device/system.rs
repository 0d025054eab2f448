//! Host implementations backed by losetup, sfdisk, partx and mkfs.

use anyhow::{bail, Result};
use std::path::{Path, PathBuf};

use super::layout::{FsKind, Partition};
use super::{BlockDeviceDriver, Formatter};
use crate::process::Cmd;

pub struct LosetupDriver;

impl BlockDeviceDriver for LosetupDriver {
    fn attach(&self, image: &Path) -> Result<PathBuf> {
        let out = Cmd::new("losetup")
            .args(["--find", "--show", "--partscan"])
            .arg_path(image)
            .error_msg("losetup could not bind the image")
            .run()?;
        let device = out.stdout.trim();
        if device.is_empty() {
            bail!("losetup printed no device for {}", image.display());
        }
        Ok(PathBuf::from(device))
    }

    fn detach(&self, device: &Path) -> Result<()> {
        let out = Cmd::new("losetup")
            .arg("--detach")
            .arg_path(device)
            .allow_fail()
            .run()?;
        // An already released device is not an error.
        if !out.success() && !out.stderr.contains("No such device") {
            bail!(
                "losetup --detach {} failed ({})\n{}",
                device.display(),
                out.status,
                out.stderr.trim()
            );
        }
        Ok(())
    }

    fn write_partition_table(&self, device: &Path, script: &str) -> Result<()> {
        Cmd::new("sfdisk")
            .args(["--wipe", "always", "--quiet"])
            .arg_path(device)
            .stdin_bytes(script)
            .error_msg("sfdisk failed to write the partition table")
            .run()?;
        Ok(())
    }

    fn rescan(&self, device: &Path) -> Result<()> {
        Cmd::new("partx")
            .arg("--update")
            .arg_path(device)
            .run()?;
        Ok(())
    }
}

pub struct MkfsFormatter;

impl MkfsFormatter {
    fn command(partition: &Partition) -> Cmd {
        match partition.kind {
            FsKind::Fat32 => Cmd::new("mkfs.vfat")
                .args(["-F", "32", "-n", partition.label])
                .arg_path(&partition.node),
            FsKind::Ext4 => Cmd::new("mkfs.ext4")
                .args(["-F", "-q", "-L", partition.label])
                .args(["-E", "lazy_itable_init=0,lazy_journal_init=0"])
                .arg_path(&partition.node),
        }
    }
}

impl Formatter for MkfsFormatter {
    fn format(&self, partition: &Partition) -> Result<()> {
        let msg = format!("creating {} on {}", partition.kind, partition.node.display());
        Self::command(partition).error_msg(&msg).run()?;
        Ok(())
    }
}
