//! The build orchestrator.
//!
//! ```text
//! workspace -> fetch + verify -> allocate -> attach -> partition
//!   -> wait for nodes -> format -> mount root -> mount boot
//!   -> stages -> release -> compress + outputs
//! ```
//!
//! Every host resource is handed to the [`CleanupController`] the moment it
//! exists, and [`run`] tears down through it exactly once whatever happens
//! in between. The interrupt flag is checked between every step.
//!
//! Host preflight ([`crate::preflight::check_host`]) is the caller's job so
//! the orchestrator can run against test doubles without privileges.

use anyhow::anyhow;
use log::{info, warn};
use std::path::PathBuf;

use crate::chroot::{ChrootExecutor, ChrootRunner, SystemChroot};
use crate::cleanup::{CancelFlag, CleanupController};
use crate::config::BuildConfig;
use crate::device::system::{LosetupDriver, MkfsFormatter};
use crate::device::{BlockDeviceDriver, BlockDeviceManager, Formatter, PartitionLayout};
use crate::error::{BuildError, Result};
use crate::fetch::{fetch_base_archive, Fetcher, HttpFetcher};
use crate::finalize::{self, now_utc_rfc3339};
use crate::mount::{MountManager, Mounter, SystemMounter};
use crate::packages::{PackageManager, Pacman};
use crate::stages::{generate_password, Pipeline, StageContext, StageRecord};
use crate::workspace::Workspace;

/// The host collaborators a build drives.
pub struct Toolchain {
    pub devices: Box<dyn BlockDeviceDriver>,
    pub formatter: Box<dyn Formatter>,
    pub mounter: Box<dyn Mounter>,
    pub chroot: Box<dyn ChrootRunner>,
    pub packages: Box<dyn PackageManager>,
    pub fetcher: Box<dyn Fetcher>,
}

impl Toolchain {
    /// Real host tools.
    pub fn system(config: &BuildConfig) -> Result<Self> {
        Ok(Self {
            devices: Box::new(LosetupDriver),
            formatter: Box::new(MkfsFormatter),
            mounter: Box::new(SystemMounter),
            chroot: Box::new(SystemChroot),
            packages: Box::new(Pacman),
            fetcher: Box::new(HttpFetcher::new(config.fetch.clone())?),
        })
    }
}

/// What a successful build produced.
#[derive(Debug, Clone)]
pub struct BuildResult {
    pub artifact: PathBuf,
    pub credential_file: PathBuf,
    pub manifest: PathBuf,
    pub root_password: String,
    pub stages: Vec<StageRecord>,
    /// Set when the workspace outlived the build (custom workdir or --keep).
    pub workspace: Option<PathBuf>,
}

/// Run one build end to end.
pub fn run(config: &BuildConfig, toolchain: Toolchain, cancel: &CancelFlag) -> Result<BuildResult> {
    let Toolchain {
        devices,
        formatter,
        mounter,
        chroot,
        packages,
        fetcher,
    } = toolchain;

    cancel.check()?;
    let started = now_utc_rfc3339().unwrap_or_default();
    let workspace = Workspace::create(config)?;
    let workspace_root = workspace.root().to_path_buf();
    println!(
        "=== Building {} image for Raspberry Pi {} ===",
        config.hostname, config.model
    );
    info!("workspace: {}", workspace_root.display());

    let mut cleanup = CleanupController::new(
        workspace,
        BlockDeviceManager::new(devices.as_ref(), formatter.as_ref()),
        MountManager::new(mounter),
        config.keep_resources,
    );

    let services = Services {
        chroot: chroot.as_ref(),
        packages: packages.as_ref(),
        fetcher: fetcher.as_ref(),
    };
    let outcome = provision(config, &mut cleanup, &services, cancel, &started);
    let outcome = match outcome {
        Err(e) if cancel.is_cancelled() && !matches!(e, BuildError::Interrupted) => {
            warn!("aborted after interrupt: {}", e);
            Err(BuildError::Interrupted)
        }
        other => other,
    };

    let warnings = cleanup.teardown(outcome.is_ok());
    if !warnings.is_empty() {
        warn!("cleanup finished with {} warning(s)", warnings.len());
    }
    drop(cleanup);

    outcome.map(|mut result| {
        result.workspace = workspace_root.exists().then_some(workspace_root);
        result
    })
}

struct Services<'a> {
    chroot: &'a dyn ChrootRunner,
    packages: &'a dyn PackageManager,
    fetcher: &'a dyn Fetcher,
}

fn provision(
    config: &BuildConfig,
    cleanup: &mut CleanupController<'_>,
    services: &Services<'_>,
    cancel: &CancelFlag,
    started: &str,
) -> Result<BuildResult> {
    let archive = fetch_base_archive(services.fetcher, config, &cleanup.workspace().downloads())?;
    cancel.check()?;

    let layout = PartitionLayout::for_config(config);
    let image = cleanup
        .devices()
        .allocate(&cleanup.workspace().image_path(), config.image_size)?;
    cancel.check()?;

    let device = cleanup.devices().attach(&image)?;
    cleanup.register_loop(device)?;
    cancel.check()?;

    let partitions = {
        let device = cleanup
            .loop_device()
            .ok_or_else(|| BuildError::device("attach", anyhow!("loop device was not registered")))?;
        cleanup.devices().partition(device, &layout)?;
        cleanup.devices().wait_for_partition_nodes(device, &layout)?
    };
    for partition in &partitions {
        cancel.check()?;
        cleanup.devices().format(partition)?;
    }
    cancel.check()?;

    let [boot, root] = partitions;
    let mount_root = cleanup.workspace().mount_root();
    cleanup.mounts().mount_root(&root, &mount_root)?;
    cleanup.mounts().mount_boot(&boot)?;
    cancel.check()?;

    let root_password = generate_password();
    let ctx = StageContext {
        root: &mount_root,
        config,
        archive: &archive,
        chroot: ChrootExecutor::new(services.chroot, &mount_root),
        packages: services.packages,
        fetcher: services.fetcher,
        root_password: &root_password,
    };
    let stages = Pipeline::standard().run(&ctx, cancel)?;
    cancel.check()?;

    cleanup.release_for_finalize()?;
    let outputs = finalize::write_outputs(
        config,
        &image,
        &root_password,
        &stages,
        started,
    )
    .map_err(|source| BuildError::Finalize { source })?;

    Ok(BuildResult {
        artifact: outputs.artifact,
        credential_file: outputs.credential_file,
        manifest: outputs.manifest,
        root_password,
        stages,
        workspace: None,
    })
}
