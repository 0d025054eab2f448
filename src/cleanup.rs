//! Resource ownership and teardown.
//!
//! [`CleanupController`] is the single owner of everything a build acquires
//! on the host: the workspace, the loop device and the mounts. Whatever path
//! the run takes out of the orchestrator (success, an error from any step,
//! an interrupt, a panic unwinding through `Drop`), teardown runs once:
//!
//! 1. unmount boot
//! 2. unmount root
//! 3. detach the loop device
//! 4. remove the workspace (success under the default prefix only)
//!
//! Each step is best-effort; failures come back as [`CleanupWarning`]s.

use log::{info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::device::{BlockDeviceManager, LoopDevice};
use crate::error::{BuildError, CleanupWarning, Result};
use crate::mount::{MountManager, ReleaseMode};
use crate::workspace::Workspace;

/// Set from the signal handler, polled by the orchestrator.
///
/// The handler never tears anything down itself; the build notices the flag
/// after the current operation returns.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Interrupted)` once the flag is set.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(BuildError::Interrupted);
        }
        Ok(())
    }

    /// Route SIGINT and SIGTERM to this flag.
    pub fn install_signal_handler(&self) -> anyhow::Result<()> {
        let flag = self.clone();
        ctrlc::set_handler(move || {
            if !flag.is_cancelled() {
                eprintln!("\nInterrupt received; cleaning up after the current step...");
            }
            flag.cancel();
        })?;
        Ok(())
    }
}

pub struct CleanupController<'a> {
    workspace: Workspace,
    devices: BlockDeviceManager<'a>,
    loop_device: Option<LoopDevice>,
    mounts: MountManager,
    keep: bool,
    torn_down: bool,
}

impl<'a> CleanupController<'a> {
    pub fn new(
        workspace: Workspace,
        devices: BlockDeviceManager<'a>,
        mounts: MountManager,
        keep: bool,
    ) -> Self {
        Self {
            workspace,
            devices,
            loop_device: None,
            mounts,
            keep,
            torn_down: false,
        }
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn devices(&self) -> &BlockDeviceManager<'a> {
        &self.devices
    }

    pub fn mounts(&mut self) -> &mut MountManager {
        &mut self.mounts
    }

    /// Take ownership of the build's loop device. Only one may be live.
    pub fn register_loop(&mut self, device: LoopDevice) -> Result<()> {
        if let Some(existing) = self.loop_device.as_ref().filter(|d| d.is_attached()) {
            return Err(BuildError::device(
                "attach",
                anyhow::anyhow!(
                    "{} is already attached for this build",
                    existing.path().display()
                ),
            ));
        }
        self.loop_device = Some(device);
        Ok(())
    }

    pub fn loop_device(&self) -> Option<&LoopDevice> {
        self.loop_device.as_ref()
    }

    /// Forward-path release before compression: any failure is fatal.
    pub fn release_for_finalize(&mut self) -> Result<()> {
        self.mounts.unmount_all(ReleaseMode::Strict)?;
        if let Some(device) = self.loop_device.as_mut() {
            self.devices.detach(device)?;
        }
        Ok(())
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    /// Release everything still held. Runs once; later calls return nothing.
    pub fn teardown(&mut self, success: bool) -> Vec<CleanupWarning> {
        if self.torn_down {
            return Vec::new();
        }
        self.torn_down = true;

        if self.keep {
            self.report_kept();
            return Vec::new();
        }

        let mut warnings = match self.mounts.unmount_all(ReleaseMode::BestEffort) {
            Ok(w) => w,
            Err(e) => vec![CleanupWarning::new("unmount", &e)],
        };

        if let Some(device) = self.loop_device.as_mut() {
            if let Err(e) = self.devices.detach(device) {
                let chain = format!("{:#}", anyhow::Error::from(e));
                let warning = CleanupWarning::new("detach-loop", &chain);
                warn!("{}", warning);
                warnings.push(warning);
            }
        }

        if success && self.workspace.is_removable() {
            if let Err(e) = self.workspace.remove() {
                let warning = CleanupWarning::new("remove-workspace", &e);
                warn!("{}", warning);
                warnings.push(warning);
            }
        } else {
            info!("workspace preserved at {}", self.workspace.root().display());
        }

        warnings
    }

    fn report_kept(&self) {
        warn!("--keep set: leaving build resources in place");
        if self.mounts.has_active_mounts() {
            if let Some(root) = self.mounts.root_target() {
                warn!("  mounted: {} (boot at {}/boot)", root.display(), root.display());
            }
        }
        if let Some(device) = self.loop_device.as_ref().filter(|d| d.is_attached()) {
            warn!(
                "  loop device: {} -> {}",
                device.path().display(),
                device.backing_file().display()
            );
        }
        warn!("  workspace: {}", self.workspace.root().display());
    }
}

impl Drop for CleanupController<'_> {
    fn drop(&mut self) {
        if !self.torn_down {
            for warning in self.teardown(false) {
                warn!("cleanup: {}", warning);
            }
        }
    }
}
