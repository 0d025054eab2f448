//! Mounting the image partitions under the workspace.
//!
//! Root is mounted first and boot nests inside it at `<root>/boot`, so the
//! boot mount must always be released first.

use anyhow::{anyhow, Context};
use log::{info, warn};
use std::fs;
use std::path::{Path, PathBuf};

use crate::device::Partition;
use crate::error::{BuildError, CleanupWarning, Result};
use crate::process::Cmd;

/// Mount table operations.
pub trait Mounter {
    fn mount(&self, source: &Path, target: &Path, fstype: &str) -> anyhow::Result<()>;
    fn unmount(&self, target: &Path) -> anyhow::Result<()>;
}

/// mount(8)/umount(8) on the host.
pub struct SystemMounter;

impl Mounter for SystemMounter {
    fn mount(&self, source: &Path, target: &Path, fstype: &str) -> anyhow::Result<()> {
        Cmd::new("mount")
            .args(["-t", fstype])
            .arg_path(source)
            .arg_path(target)
            .run()?;
        Ok(())
    }

    fn unmount(&self, target: &Path) -> anyhow::Result<()> {
        Cmd::new("umount").arg_path(target).run()?;
        Ok(())
    }
}

/// How release failures are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseMode {
    /// Forward path: the first failure aborts and is returned.
    Strict,
    /// Cleanup path: every step is attempted, failures become warnings.
    BestEffort,
}

#[derive(Debug)]
pub struct MountHandle {
    pub partition: Partition,
    pub target: PathBuf,
    mounted: bool,
}

impl MountHandle {
    pub fn is_mounted(&self) -> bool {
        self.mounted
    }
}

pub struct MountManager {
    mounter: Box<dyn Mounter>,
    root: Option<MountHandle>,
    boot: Option<MountHandle>,
}

impl MountManager {
    pub fn new(mounter: Box<dyn Mounter>) -> Self {
        Self {
            mounter,
            root: None,
            boot: None,
        }
    }

    /// Mount the root partition at `target`.
    pub fn mount_root(&mut self, partition: &Partition, target: &Path) -> Result<()> {
        if self.root.as_ref().is_some_and(MountHandle::is_mounted) {
            return Err(mount_error(target, anyhow!("root is already mounted")));
        }
        fs::create_dir_all(target)
            .with_context(|| format!("creating mount point {}", target.display()))
            .map_err(|e| mount_error(target, e))?;
        self.mounter
            .mount(&partition.node, target, partition.kind.mount_type())
            .map_err(|e| mount_error(target, e))?;
        info!("mounted {} at {}", partition.node.display(), target.display());
        self.root = Some(MountHandle {
            partition: partition.clone(),
            target: target.to_path_buf(),
            mounted: true,
        });
        Ok(())
    }

    /// Mount the boot partition at `<root>/boot`. Requires a live root mount.
    pub fn mount_boot(&mut self, partition: &Partition) -> Result<PathBuf> {
        let root = match &self.root {
            Some(handle) if handle.mounted => handle.target.clone(),
            _ => {
                return Err(mount_error(
                    &partition.node,
                    anyhow!("boot cannot be mounted before root"),
                ))
            }
        };
        let target = root.join("boot");
        fs::create_dir_all(&target)
            .with_context(|| format!("creating mount point {}", target.display()))
            .map_err(|e| mount_error(&target, e))?;
        self.mounter
            .mount(&partition.node, &target, partition.kind.mount_type())
            .map_err(|e| mount_error(&target, e))?;
        info!("mounted {} at {}", partition.node.display(), target.display());
        self.boot = Some(MountHandle {
            partition: partition.clone(),
            target: target.clone(),
            mounted: true,
        });
        Ok(target)
    }

    pub fn root_target(&self) -> Option<&Path> {
        self.root
            .as_ref()
            .filter(|h| h.mounted)
            .map(|h| h.target.as_path())
    }

    pub fn has_active_mounts(&self) -> bool {
        [&self.boot, &self.root]
            .into_iter()
            .flatten()
            .any(MountHandle::is_mounted)
    }

    /// Unmount boot, then root.
    ///
    /// In [`ReleaseMode::BestEffort`] a failed boot unmount does not stop the
    /// root attempt; both failures come back as warnings. A handle that
    /// failed to unmount stays marked mounted.
    pub fn unmount_all(&mut self, mode: ReleaseMode) -> Result<Vec<CleanupWarning>> {
        let mut warnings = Vec::new();
        for (step, slot) in [("unmount-boot", &mut self.boot), ("unmount-root", &mut self.root)] {
            let Some(handle) = slot.as_mut() else {
                continue;
            };
            if !handle.mounted {
                continue;
            }
            match self.mounter.unmount(&handle.target) {
                Ok(()) => {
                    handle.mounted = false;
                    info!("unmounted {}", handle.target.display());
                }
                Err(e) if mode == ReleaseMode::BestEffort => {
                    let warning = CleanupWarning::new(
                        step,
                        &format!("{}: {:#}", handle.target.display(), e),
                    );
                    warn!("{}", warning);
                    warnings.push(warning);
                }
                Err(e) => return Err(mount_error(&handle.target, e)),
            }
        }
        Ok(warnings)
    }
}

fn mount_error(target: &Path, source: anyhow::Error) -> BuildError {
    BuildError::Mount {
        target: target.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ByteSize;
    use crate::device::PartitionLayout;
    use std::cell::RefCell;
    use std::collections::HashSet;
    use std::rc::Rc;
    use tempfile::TempDir;

    #[derive(Clone, Default)]
    struct Recorder {
        log: Rc<RefCell<Vec<String>>>,
        failing: Rc<RefCell<HashSet<PathBuf>>>,
    }

    impl Mounter for Recorder {
        fn mount(&self, source: &Path, target: &Path, fstype: &str) -> anyhow::Result<()> {
            self.log.borrow_mut().push(format!(
                "mount {} {} {}",
                fstype,
                source.display(),
                target.display()
            ));
            Ok(())
        }

        fn unmount(&self, target: &Path) -> anyhow::Result<()> {
            self.log
                .borrow_mut()
                .push(format!("umount {}", target.display()));
            if self.failing.borrow().contains(target) {
                anyhow::bail!("target is busy");
            }
            Ok(())
        }
    }

    fn partitions() -> [Partition; 2] {
        PartitionLayout::new(ByteSize::gib(4), ByteSize::mib(512)).partitions(Path::new("/dev/loop0"))
    }

    #[test]
    fn test_boot_requires_root() {
        let mut mounts = MountManager::new(Box::new(Recorder::default()));
        let [boot, _] = partitions();
        let err = mounts.mount_boot(&boot).unwrap_err();
        assert!(matches!(err, BuildError::Mount { .. }));
        assert!(!mounts.has_active_mounts());
    }

    #[test]
    fn test_unmount_order_is_boot_then_root() {
        let temp = TempDir::new().unwrap();
        let recorder = Recorder::default();
        let mut mounts = MountManager::new(Box::new(recorder.clone()));
        let [boot, root] = partitions();
        let mnt = temp.path().join("mnt");

        mounts.mount_root(&root, &mnt).unwrap();
        let boot_target = mounts.mount_boot(&boot).unwrap();
        assert_eq!(boot_target, mnt.join("boot"));
        assert!(boot_target.is_dir());

        let warnings = mounts.unmount_all(ReleaseMode::Strict).unwrap();
        assert!(warnings.is_empty());
        let log = recorder.log.borrow();
        assert_eq!(
            log.as_slice(),
            &[
                format!("mount ext4 /dev/loop0p2 {}", mnt.display()),
                format!("mount vfat /dev/loop0p1 {}", boot_target.display()),
                format!("umount {}", boot_target.display()),
                format!("umount {}", mnt.display()),
            ]
        );
        assert!(!mounts.has_active_mounts());
    }

    #[test]
    fn test_best_effort_continues_past_boot_failure() {
        let temp = TempDir::new().unwrap();
        let recorder = Recorder::default();
        let mut mounts = MountManager::new(Box::new(recorder.clone()));
        let [boot, root] = partitions();
        let mnt = temp.path().join("mnt");
        mounts.mount_root(&root, &mnt).unwrap();
        let boot_target = mounts.mount_boot(&boot).unwrap();
        recorder.failing.borrow_mut().insert(boot_target.clone());

        let warnings = mounts.unmount_all(ReleaseMode::BestEffort).unwrap();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].step, "unmount-boot");
        assert_eq!(recorder.log.borrow().last().unwrap(), &format!("umount {}", mnt.display()));
        // Boot is still mounted, so the manager still reports it.
        assert!(mounts.has_active_mounts());
    }

    #[test]
    fn test_strict_release_fails_fast() {
        let temp = TempDir::new().unwrap();
        let recorder = Recorder::default();
        let mut mounts = MountManager::new(Box::new(recorder.clone()));
        let [boot, root] = partitions();
        let mnt = temp.path().join("mnt");
        mounts.mount_root(&root, &mnt).unwrap();
        let boot_target = mounts.mount_boot(&boot).unwrap();
        recorder.failing.borrow_mut().insert(boot_target);

        assert!(mounts.unmount_all(ReleaseMode::Strict).is_err());
        assert_eq!(mounts.root_target(), Some(mnt.as_path()));
    }

    #[test]
    fn test_unmount_all_twice_is_noop() {
        let temp = TempDir::new().unwrap();
        let recorder = Recorder::default();
        let mut mounts = MountManager::new(Box::new(recorder.clone()));
        let [_, root] = partitions();
        mounts.mount_root(&root, &temp.path().join("mnt")).unwrap();
        mounts.unmount_all(ReleaseMode::BestEffort).unwrap();
        mounts.unmount_all(ReleaseMode::BestEffort).unwrap();
        let umounts = recorder
            .log
            .borrow()
            .iter()
            .filter(|l| l.starts_with("umount"))
            .count();
        assert_eq!(umounts, 1);
    }
}
