//! Fixed two-partition MBR layout for Raspberry Pi images.
//!
//! The Pi firmware reads the first FAT partition of an MBR disk, so the
//! table is `dos`: partition 1 is a bootable W95 FAT32 (LBA) partition of
//! the configured boot size, partition 2 is a Linux partition taking the
//! remainder of the image.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::config::{BuildConfig, ByteSize};

/// Sector size in bytes.
pub const SECTOR_SIZE: u64 = 512;

/// First partition starts at this offset (1MB alignment).
pub const FIRST_PARTITION_OFFSET_SECTORS: u64 = 2048;

pub const BOOT_LABEL: &str = "BOOT";
pub const ROOT_LABEL: &str = "ROOT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsKind {
    Fat32,
    Ext4,
}

impl FsKind {
    /// Filesystem type name as understood by mount(8).
    pub fn mount_type(self) -> &'static str {
        match self {
            Self::Fat32 => "vfat",
            Self::Ext4 => "ext4",
        }
    }
}

impl fmt::Display for FsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fat32 => write!(f, "FAT32"),
            Self::Ext4 => write!(f, "ext4"),
        }
    }
}

/// One partition as it exists on an attached loop device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub index: u8,
    pub node: PathBuf,
    pub kind: FsKind,
    pub label: &'static str,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionLayout {
    pub image_size: ByteSize,
    pub boot_size: ByteSize,
}

impl PartitionLayout {
    pub fn new(image_size: ByteSize, boot_size: ByteSize) -> Self {
        Self {
            image_size,
            boot_size,
        }
    }

    pub fn for_config(config: &BuildConfig) -> Self {
        Self::new(config.image_size, config.boot_size)
    }

    pub fn boot_sectors(&self) -> u64 {
        self.boot_size.as_bytes() / SECTOR_SIZE
    }

    pub fn root_start_sector(&self) -> u64 {
        FIRST_PARTITION_OFFSET_SECTORS + self.boot_sectors()
    }

    pub fn root_size_bytes(&self) -> u64 {
        self.image_size.as_bytes() - self.root_start_sector() * SECTOR_SIZE
    }

    /// sfdisk input describing the whole table.
    pub fn sfdisk_script(&self) -> String {
        format!(
            "label: dos\n\
             unit: sectors\n\
             \n\
             start={}, size={}, type=c, bootable\n\
             start={}, type=83\n",
            FIRST_PARTITION_OFFSET_SECTORS,
            self.boot_sectors(),
            self.root_start_sector(),
        )
    }

    /// Partitions as they appear on `device` once the kernel has scanned it.
    pub fn partitions(&self, device: &Path) -> [Partition; 2] {
        [
            Partition {
                index: 1,
                node: partition_node(device, 1),
                kind: FsKind::Fat32,
                label: BOOT_LABEL,
                size_bytes: self.boot_size.as_bytes(),
            },
            Partition {
                index: 2,
                node: partition_node(device, 2),
                kind: FsKind::Ext4,
                label: ROOT_LABEL,
                size_bytes: self.root_size_bytes(),
            },
        ]
    }
}

/// Device node of partition `index` (handles `loop0p1` vs `sda1` naming).
pub fn partition_node(device: &Path, index: u8) -> PathBuf {
    let name = device.as_os_str().to_string_lossy();
    if name.ends_with(|c: char| c.is_ascii_digit()) {
        PathBuf::from(format!("{}p{}", name, index))
    } else {
        PathBuf::from(format!("{}{}", name, index))
    }
}
