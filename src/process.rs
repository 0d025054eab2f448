//! Thin builder around `std::process::Command` for host tools.
//!
//! Every external tool the builder drives (losetup, sfdisk, mkfs, mount,
//! chroot) goes through [`Cmd`], so command lines are traced at `debug`
//! level and failures carry the tool's stderr.

use anyhow::{bail, Context, Result};
use log::debug;
use std::ffi::{OsStr, OsString};
use std::io::Write;
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};

/// Captured result of a finished command.
#[derive(Debug)]
pub struct CommandResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

/// Command builder with error reporting.
#[derive(Debug, Clone)]
pub struct Cmd {
    program: OsString,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
    clear_env: bool,
    stdin: Option<Vec<u8>>,
    error_msg: Option<String>,
    allow_fail: bool,
}

impl Cmd {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            envs: Vec::new(),
            clear_env: false,
            stdin: None,
            error_msg: None,
            allow_fail: false,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn arg_path(self, path: &Path) -> Self {
        self.arg(path.as_os_str())
    }

    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.envs
            .push((key.as_ref().to_os_string(), value.as_ref().to_os_string()));
        self
    }

    /// Start from an empty environment; only [`Cmd::env`] values are passed.
    pub fn env_clear(mut self) -> Self {
        self.clear_env = true;
        self
    }

    /// Bytes written to the child's stdin.
    pub fn stdin_bytes(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Message used as the error headline when the command fails.
    pub fn error_msg(mut self, msg: &str) -> Self {
        self.error_msg = Some(msg.to_string());
        self
    }

    /// Return the result instead of failing on non-zero exit.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    /// Human-readable command line, used in logs and error messages.
    pub fn display(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|part| part.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn run(self) -> Result<CommandResult> {
        let line = self.display();
        debug!("$ {}", line);

        let mut command = Command::new(&self.program);
        command.args(&self.args);
        if self.clear_env {
            command.env_clear();
        }
        command.envs(self.envs.iter().map(|(k, v)| (k, v)));
        command
            .stdin(if self.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn `{}`", line))?;

        if let Some(input) = &self.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                stdin
                    .write_all(input)
                    .with_context(|| format!("writing stdin of `{}`", line))?;
            }
        }

        let output = child
            .wait_with_output()
            .with_context(|| format!("waiting for `{}`", line))?;
        let result = CommandResult {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !result.success() && !self.allow_fail {
            let headline = self
                .error_msg
                .unwrap_or_else(|| format!("`{}` failed", line));
            bail!(
                "{} ({})\n{}",
                headline,
                result.status,
                result.stderr.trim()
            );
        }

        Ok(result)
    }
}
