//! Package installation inside the image.

use std::path::PathBuf;

use crate::chroot::{ChrootCommand, ChrootExecutor};
use crate::config::TargetModel;
use crate::error::{BuildError, Result};

/// Package operations against the mounted root.
pub trait PackageManager {
    fn refresh(&self, chroot: &ChrootExecutor<'_>) -> Result<()>;
    fn install(&self, chroot: &ChrootExecutor<'_>, packages: &[String]) -> Result<()>;
    /// Remove packages without dependency checks.
    fn remove(&self, chroot: &ChrootExecutor<'_>, packages: &[String]) -> Result<()>;
    fn upgrade(&self, chroot: &ChrootExecutor<'_>) -> Result<()>;
}

pub struct Pacman;

impl PackageManager for Pacman {
    fn refresh(&self, chroot: &ChrootExecutor<'_>) -> Result<()> {
        chroot.run(&ChrootCommand::new("pacman").arg("-Sy"))
    }

    fn install(&self, chroot: &ChrootExecutor<'_>, packages: &[String]) -> Result<()> {
        if packages.is_empty() {
            return Ok(());
        }
        chroot.run(
            &ChrootCommand::new("pacman")
                .args(["-S", "--needed", "--noconfirm"])
                .args(packages.iter().cloned()),
        )
    }

    fn remove(&self, chroot: &ChrootExecutor<'_>, packages: &[String]) -> Result<()> {
        if packages.is_empty() {
            return Ok(());
        }
        chroot.run(
            &ChrootCommand::new("pacman")
                .args(["-Rdd", "--noconfirm"])
                .args(packages.iter().cloned()),
        )
    }

    fn upgrade(&self, chroot: &ChrootExecutor<'_>) -> Result<()> {
        chroot.run(&ChrootCommand::new("pacman").args(["-Syu", "--noconfirm"]))
    }
}

/// Kernel and boot firmware for one board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelSet {
    /// Generic packages shipped in the base archive that conflict.
    pub replaces: Vec<String>,
    pub packages: Vec<String>,
    /// Kernel image the firmware loads, relative to the root.
    pub kernel_image: PathBuf,
}

impl KernelSet {
    pub fn for_model(model: TargetModel) -> Self {
        let kernel = match model {
            TargetModel::Pi4 => "linux-rpi",
            TargetModel::Pi5 => "linux-rpi-16k",
        };
        let image = match model {
            TargetModel::Pi4 => "boot/kernel8.img",
            TargetModel::Pi5 => "boot/kernel_2712.img",
        };
        Self {
            replaces: strings(&["linux-aarch64", "uboot-raspberrypi"]),
            packages: strings(&[kernel, "raspberrypi-bootloader", "firmware-raspberrypi"]),
            kernel_image: PathBuf::from(image),
        }
    }

    /// Install the set, then confirm the model's kernel image landed.
    pub fn install(&self, pm: &dyn PackageManager, chroot: &ChrootExecutor<'_>) -> Result<()> {
        pm.remove(chroot, &self.replaces)?;
        pm.install(chroot, &self.packages)?;
        self.verify(chroot)
    }

    pub fn verify(&self, chroot: &ChrootExecutor<'_>) -> Result<()> {
        let image = chroot.root().join(&self.kernel_image);
        if !image.is_file() {
            return Err(BuildError::Verification(format!(
                "expected kernel image /{} after installing {}",
                self.kernel_image.display(),
                self.packages.join(" ")
            )));
        }
        Ok(())
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
