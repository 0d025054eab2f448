//! Per-invocation scratch directory.
//!
//! ```text
//! <base>/build-<pid>-<nanos>/
//!     downloads/   base archive + digest
//!     mnt/         root partition mount point (boot nests at mnt/boot)
//!     disk.img     raw image while it is being provisioned
//! ```

use log::{debug, info};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::{is_under, BuildConfig};
use crate::error::{BuildError, Result};

#[derive(Debug)]
pub struct Workspace {
    root: PathBuf,
    default_base: PathBuf,
}

impl Workspace {
    /// Create a fresh workspace under the configured base.
    pub fn create(config: &BuildConfig) -> Result<Self> {
        let base = config
            .workdir
            .clone()
            .unwrap_or_else(|| config.default_workdir.clone());
        Self::create_in(&base, &config.default_workdir)
    }

    pub fn create_in(base: &Path, default_base: &Path) -> Result<Self> {
        let root = base.join(unique_name("build"));
        let ws = Self {
            root,
            default_base: default_base.to_path_buf(),
        };
        for dir in [ws.root.clone(), ws.downloads(), ws.mount_root()] {
            fs::create_dir_all(&dir).map_err(|source| BuildError::Workspace {
                path: dir.clone(),
                source,
            })?;
        }
        debug!("workspace created at {}", ws.root.display());
        Ok(ws)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn downloads(&self) -> PathBuf {
        self.root.join("downloads")
    }

    pub fn mount_root(&self) -> PathBuf {
        self.root.join("mnt")
    }

    pub fn image_path(&self) -> PathBuf {
        self.root.join("disk.img")
    }

    /// Only workspaces under the default prefix may be deleted.
    pub fn is_removable(&self) -> bool {
        is_under(&self.root, &self.default_base)
    }

    /// Delete the workspace tree. Callers decide whether that is allowed.
    pub fn remove(&self) -> std::io::Result<()> {
        if self.root.exists() {
            fs::remove_dir_all(&self.root)?;
            info!("removed workspace {}", self.root.display());
        }
        Ok(())
    }
}

fn unique_name(prefix: &str) -> String {
    let n = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("{}-{}-{}", prefix, std::process::id(), n)
}
