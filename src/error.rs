//! Error taxonomy for a build run.
//!
//! Every fatal condition is a [`BuildError`]. The variant tells the operator
//! *where* the run died (configuration, host, download, device, mount, a
//! provisioning stage, finalization) and decides the process exit status.
//! Non-fatal teardown problems are [`CleanupWarning`] values instead.

use std::fmt;
use std::path::PathBuf;
use std::process::ExitStatus;

/// Result alias used by the component APIs.
pub type Result<T> = std::result::Result<T, BuildError>;

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// Bad command line (unknown flag, missing flag value).
    #[error("usage: {0}")]
    Usage(String),

    #[error("invalid configuration for '{field}': {reason}")]
    Validation { field: String, reason: String },

    #[error("missing host dependency: {what} ({hint})")]
    DependencyMissing { what: String, hint: String },

    #[error("download of '{url}' failed")]
    Download {
        url: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("checksum mismatch for '{}': expected {expected}, got {actual}", path.display())]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("workspace error at '{}'", path.display())]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("device setup failed during {step}")]
    DeviceSetup {
        step: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("mount operation on '{}' failed", target.display())]
    Mount {
        target: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("command `{command}` failed inside chroot ({status})")]
    ChrootExecution { command: String, status: String },

    #[error("verification failed: {0}")]
    Verification(String),

    #[error("stage '{stage}' failed")]
    Stage {
        stage: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("finalizing the image failed")]
    Finalize {
        #[source]
        source: anyhow::Error,
    },

    #[error("interrupted by signal")]
    Interrupted,
}

impl BuildError {
    pub fn validation(field: &str, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.to_string(),
            reason: reason.into(),
        }
    }

    pub fn device(step: &'static str, source: impl Into<anyhow::Error>) -> Self {
        Self::DeviceSetup {
            step,
            source: source.into(),
        }
    }

    pub fn chroot(command: impl Into<String>, status: ExitStatus) -> Self {
        Self::ChrootExecution {
            command: command.into(),
            status: status.to_string(),
        }
    }

    /// Process exit status for this error.
    ///
    /// A stage failure reports the code of the error that caused it, so a
    /// verification failure inside a stage still exits with the stage code
    /// while an interrupt observed mid-stage exits with 130.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Usage(_) | Self::Validation { .. } => 2,
            Self::DependencyMissing { .. } => 3,
            Self::Download { .. } | Self::ChecksumMismatch { .. } => 4,
            Self::DeviceSetup { .. } | Self::Mount { .. } => 5,
            Self::ChrootExecution { .. } | Self::Verification(_) => 6,
            Self::Stage { source, .. } => match source.downcast_ref::<BuildError>() {
                Some(Self::Interrupted) => 130,
                _ => 6,
            },
            Self::Finalize { .. } => 7,
            Self::Interrupted => 130,
            Self::Workspace { .. } => 1,
        }
    }

    /// Name of the pipeline stage that failed, if the error came from one.
    pub fn failed_stage(&self) -> Option<&'static str> {
        match self {
            Self::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

/// A teardown step that did not complete. Logged, never fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupWarning {
    pub step: String,
    pub message: String,
}

impl CleanupWarning {
    pub fn new(step: impl Into<String>, err: &dyn fmt::Display) -> Self {
        Self {
            step: step.into(),
            message: err.to_string(),
        }
    }
}

impl fmt::Display for CleanupWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.step, self.message)
    }
}
