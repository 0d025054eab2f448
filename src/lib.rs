//! Raspberry Pi image builder.
//!
//! Turns the Arch Linux ARM aarch64 root filesystem tarball into a
//! provisioned, bootable, zstd-compressed disk image for a Raspberry Pi 4
//! or 5.
//!
//! # Architecture
//!
//! ```text
//! config ──> workspace ──> fetch ──> device ──> mount ──> stages ──> finalize
//!                                       │          │         │
//!                                       └──── cleanup ───────┘
//!                                            (owns every host resource,
//!                                             tears down exactly once)
//! ```
//!
//! - [`config`] - defaults, TOML file, `RPI_*` environment and flags merged
//!   into one validated [`config::BuildConfig`]
//! - [`device`] - image file, loop device, partition table, filesystems
//! - [`mount`] - root then boot mounts, released in reverse
//! - [`chroot`] - command execution inside the image, qemu shim
//! - [`stages`] - the ordered provisioning pipeline
//! - [`cleanup`] - resource ownership, teardown and interrupt handling
//! - [`finalize`] - compression, credential file and build manifest
//! - [`build`] - the orchestrator tying it together
//!
//! Host tools sit behind traits ([`device::BlockDeviceDriver`],
//! [`device::Formatter`], [`mount::Mounter`], [`chroot::ChrootRunner`],
//! [`packages::PackageManager`], [`fetch::Fetcher`]) so the whole pipeline
//! runs against test doubles without root.

pub mod build;
pub mod chroot;
pub mod cleanup;
pub mod config;
pub mod device;
pub mod error;
pub mod fetch;
pub mod finalize;
pub mod mount;
pub mod packages;
pub mod preflight;
pub mod process;
pub mod rootfs;
pub mod stages;
pub mod workspace;

pub use build::{run, BuildResult, Toolchain};
pub use cleanup::CancelFlag;
pub use config::{BuildConfig, ConfigResolver, Invocation};
pub use error::{BuildError, Result};
