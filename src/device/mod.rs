//! Block device management: image file, loop binding, partition table,
//! filesystems.
//!
//! Host tools sit behind [`BlockDeviceDriver`] and [`Formatter`]; the
//! [`system`] module holds the implementations that shell out to
//! util-linux, dosfstools and e2fsprogs.

pub mod layout;
pub mod system;

use anyhow::{anyhow, Context};
use log::{debug, info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use crate::config::ByteSize;
use crate::error::{BuildError, Result};
pub use layout::{FsKind, Partition, PartitionLayout};

/// Loop device and partition table operations.
pub trait BlockDeviceDriver {
    /// Bind `image` to a free loop device with partition scanning enabled.
    fn attach(&self, image: &Path) -> anyhow::Result<PathBuf>;

    /// Release the loop binding. Detaching an unbound device succeeds.
    fn detach(&self, device: &Path) -> anyhow::Result<()>;

    /// Replace the partition table of `device` with the sfdisk `script`.
    fn write_partition_table(&self, device: &Path, script: &str) -> anyhow::Result<()>;

    /// Ask the kernel to re-read the partition table.
    fn rescan(&self, device: &Path) -> anyhow::Result<()>;

    fn node_exists(&self, node: &Path) -> bool {
        node.exists()
    }
}

/// Filesystem creation contract.
pub trait Formatter {
    fn format(&self, partition: &Partition) -> anyhow::Result<()>;
}

/// A loop device bound to the build's image file.
#[derive(Debug)]
pub struct LoopDevice {
    device: PathBuf,
    backing_file: PathBuf,
    attached: bool,
}

impl LoopDevice {
    pub fn new(device: PathBuf, backing_file: PathBuf) -> Self {
        Self {
            device,
            backing_file,
            attached: true,
        }
    }

    pub fn path(&self) -> &Path {
        &self.device
    }

    pub fn backing_file(&self) -> &Path {
        &self.backing_file
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }
}

/// Bounded polling parameters.
#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl PollPolicy {
    pub const fn new(attempts: u32, interval: Duration) -> Self {
        Self { attempts, interval }
    }
}

pub const ATTACH_RETRY: PollPolicy = PollPolicy::new(5, Duration::from_secs(1));
pub const NODE_WAIT: PollPolicy = PollPolicy::new(40, Duration::from_millis(250));

pub struct BlockDeviceManager<'a> {
    driver: &'a dyn BlockDeviceDriver,
    formatter: &'a dyn Formatter,
    attach_retry: PollPolicy,
    node_wait: PollPolicy,
}

impl<'a> BlockDeviceManager<'a> {
    pub fn new(driver: &'a dyn BlockDeviceDriver, formatter: &'a dyn Formatter) -> Self {
        Self {
            driver,
            formatter,
            attach_retry: ATTACH_RETRY,
            node_wait: NODE_WAIT,
        }
    }

    pub fn with_polling(mut self, attach_retry: PollPolicy, node_wait: PollPolicy) -> Self {
        self.attach_retry = attach_retry;
        self.node_wait = node_wait;
        self
    }

    /// Create a sparse image file of exactly `size` bytes.
    pub fn allocate(&self, path: &Path, size: ByteSize) -> Result<PathBuf> {
        let dir = path
            .parent()
            .ok_or_else(|| BuildError::device("allocate", anyhow!("image path has no parent")))?;
        let available = fs2::available_space(dir)
            .with_context(|| format!("querying free space in {}", dir.display()))
            .map_err(|e| BuildError::device("allocate", e))?;
        if available < size.as_bytes() {
            return Err(BuildError::device(
                "allocate",
                anyhow!(
                    "{} needs {} but only {} is free",
                    dir.display(),
                    size,
                    ByteSize::bytes(available)
                ),
            ));
        }

        let file = fs::File::create(path)
            .with_context(|| format!("creating {}", path.display()))
            .map_err(|e| BuildError::device("allocate", e))?;
        file.set_len(size.as_bytes())
            .with_context(|| format!("sizing {} to {}", path.display(), size))
            .map_err(|e| BuildError::device("allocate", e))?;

        info!("allocated {} image at {}", size, path.display());
        Ok(path.to_path_buf())
    }

    /// Bind the image to a loop device.
    ///
    /// The free-device lookup and the appearance of the device node race
    /// with udev, so both are retried briefly before giving up.
    pub fn attach(&self, image: &Path) -> Result<LoopDevice> {
        let mut last_err = anyhow!("no attach attempt made");
        for attempt in 1..=self.attach_retry.attempts {
            match self.driver.attach(image) {
                Ok(device) => {
                    if self.poll(|| self.driver.node_exists(&device)) {
                        info!("attached {} to {}", image.display(), device.display());
                        return Ok(LoopDevice::new(device, image.to_path_buf()));
                    }
                    // Bound but the node never showed up: release before retrying.
                    last_err = anyhow!("device node {} did not appear", device.display());
                    if let Err(e) = self.driver.detach(&device) {
                        warn!(
                            "could not release {}; run `losetup -d {}`: {:#}",
                            device.display(),
                            device.display(),
                            e
                        );
                        last_err = last_err.context(format!(
                            "{} is still bound to {} (detach failed: {:#})",
                            device.display(),
                            image.display(),
                            e
                        ));
                    }
                }
                Err(e) => last_err = e,
            }
            warn!(
                "loop attach attempt {}/{} failed: {:#}",
                attempt, self.attach_retry.attempts, last_err
            );
            if attempt < self.attach_retry.attempts {
                thread::sleep(self.attach_retry.interval);
            }
        }
        Err(BuildError::device("attach", last_err))
    }

    /// Write the fixed two-entry table, wiping whatever was there.
    pub fn partition(&self, device: &LoopDevice, layout: &PartitionLayout) -> Result<()> {
        self.driver
            .write_partition_table(device.path(), &layout.sfdisk_script())
            .map_err(|e| BuildError::device("partition", e))?;
        if let Err(e) = self.driver.rescan(device.path()) {
            debug!("partition rescan of {} failed: {:#}", device.path().display(), e);
        }
        Ok(())
    }

    /// Poll until both partition nodes exist.
    pub fn wait_for_partition_nodes(
        &self,
        device: &LoopDevice,
        layout: &PartitionLayout,
    ) -> Result<[Partition; 2]> {
        let partitions = layout.partitions(device.path());
        let ready = self.poll(|| partitions.iter().all(|p| self.driver.node_exists(&p.node)));
        if !ready {
            let missing: Vec<String> = partitions
                .iter()
                .filter(|p| !self.driver.node_exists(&p.node))
                .map(|p| p.node.display().to_string())
                .collect();
            return Err(BuildError::device(
                "wait-for-partitions",
                anyhow!(
                    "partition nodes still missing after {} checks: {}",
                    self.node_wait.attempts,
                    missing.join(", ")
                ),
            ));
        }
        Ok(partitions)
    }

    pub fn format(&self, partition: &Partition) -> Result<()> {
        info!(
            "formatting {} as {} ({})",
            partition.node.display(),
            partition.kind,
            partition.label
        );
        self.formatter
            .format(partition)
            .map_err(|e| BuildError::device("format", e))
    }

    /// Release the loop binding. A no-op for an already detached handle.
    pub fn detach(&self, device: &mut LoopDevice) -> Result<()> {
        if !device.attached {
            return Ok(());
        }
        self.driver
            .detach(&device.device)
            .map_err(|e| BuildError::device("detach", e))?;
        device.attached = false;
        info!("detached {}", device.device.display());
        Ok(())
    }

    fn poll(&self, mut ready: impl FnMut() -> bool) -> bool {
        for attempt in 0..self.node_wait.attempts {
            if ready() {
                return true;
            }
            if attempt + 1 < self.node_wait.attempts {
                thread::sleep(self.node_wait.interval);
            }
        }
        false
    }
}
