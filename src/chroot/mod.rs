//! Running commands inside the mounted root filesystem.
//!
//! [`ChrootExecutor`] is what stages use: it binds a [`ChrootRunner`] to one
//! root path and turns any non-zero exit into
//! [`BuildError::ChrootExecution`]. Nothing is retried.

pub mod emulation;

use anyhow::Context;
use log::{debug, warn};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;

use crate::error::{BuildError, Result};
use crate::process::Cmd;

/// One command line to run inside the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChrootCommand {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<String>,
}

impl ChrootCommand {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            stdin: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Executes a command with `root` as its filesystem root.
pub trait ChrootRunner {
    /// Run to completion and report the exit status. `Err` means the
    /// command could not be started at all.
    fn status(&self, root: &Path, command: &ChrootCommand) -> anyhow::Result<ExitStatus>;
}

/// A chroot runner bound to one mounted root.
pub struct ChrootExecutor<'a> {
    runner: &'a dyn ChrootRunner,
    root: PathBuf,
}

impl<'a> ChrootExecutor<'a> {
    pub fn new(runner: &'a dyn ChrootRunner, root: &Path) -> Self {
        Self {
            runner,
            root: root.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run(&self, command: &ChrootCommand) -> Result<()> {
        let line = command.display();
        debug!("chroot {} $ {}", self.root.display(), line);
        let status = self
            .runner
            .status(&self.root, command)
            .map_err(|e| BuildError::ChrootExecution {
                command: line.clone(),
                status: format!("{:#}", e),
            })?;
        if !status.success() {
            return Err(BuildError::chroot(line, status));
        }
        Ok(())
    }
}

/// Host API filesystems made visible inside the root for one command.
const API_MOUNTS: &[&str] = &["proc", "sys", "dev", "dev/pts"];

const RESOLV_CONF: &str = "etc/resolv.conf";
const RESOLV_BACKUP: &str = "etc/resolv.conf.rpi-image-builder";

/// `chroot(8)` on the host.
pub struct SystemChroot;

impl ChrootRunner for SystemChroot {
    fn status(&self, root: &Path, command: &ChrootCommand) -> anyhow::Result<ExitStatus> {
        let _scope = ChrootScope::enter(root)?;
        let mut cmd = Cmd::new("chroot")
            .arg_path(root)
            .arg(&command.program)
            .args(&command.args)
            .env_clear()
            .env("PATH", "/usr/local/sbin:/usr/local/bin:/usr/bin:/usr/sbin")
            .env("LANG", "C")
            .env("HOME", "/root")
            .allow_fail();
        if let Some(input) = &command.stdin {
            cmd = cmd.stdin_bytes(input.as_bytes());
        }
        let out = cmd.run()?;
        if !out.success() {
            warn!("{} exited with {}\n{}", command.display(), out.status, out.stderr.trim());
        }
        Ok(out.status)
    }
}

/// Bind mounts and resolv.conf swap for the lifetime of one command.
///
/// Released in reverse order on drop.
struct ChrootScope {
    root: PathBuf,
    bound: Vec<PathBuf>,
    resolv_swapped: bool,
}

impl ChrootScope {
    fn enter(root: &Path) -> anyhow::Result<Self> {
        let mut scope = Self {
            root: root.to_path_buf(),
            bound: Vec::new(),
            resolv_swapped: false,
        };
        for api in API_MOUNTS {
            let target = root.join(api);
            fs::create_dir_all(&target)
                .with_context(|| format!("creating {}", target.display()))?;
            Cmd::new("mount")
                .arg("--bind")
                .arg(format!("/{}", api))
                .arg_path(&target)
                .run()?;
            scope.bound.push(target);
        }
        scope.swap_resolv_conf()?;
        Ok(scope)
    }

    fn swap_resolv_conf(&mut self) -> anyhow::Result<()> {
        let host = Path::new("/etc/resolv.conf");
        if !host.exists() {
            return Ok(());
        }
        let inner = self.root.join(RESOLV_CONF);
        let backup = self.root.join(RESOLV_BACKUP);
        if inner.is_symlink() || inner.exists() {
            fs::rename(&inner, &backup).context("setting aside resolv.conf")?;
        }
        self.resolv_swapped = true;
        fs::copy(host, &inner).context("installing host resolv.conf")?;
        Ok(())
    }

    /// Put the image's own resolv.conf back. Returns what could not be
    /// undone.
    fn restore_resolv_conf(&mut self) -> Vec<String> {
        let mut problems = Vec::new();
        if !self.resolv_swapped {
            return problems;
        }
        self.resolv_swapped = false;
        let inner = self.root.join(RESOLV_CONF);
        let backup = self.root.join(RESOLV_BACKUP);
        if let Err(e) = fs::remove_file(&inner) {
            if e.kind() != io::ErrorKind::NotFound {
                problems.push(format!("removing copied {}: {}", inner.display(), e));
            }
        }
        if backup.is_symlink() || backup.exists() {
            if let Err(e) = fs::rename(&backup, &inner) {
                problems.push(format!("restoring {}: {}", inner.display(), e));
            }
        }
        problems
    }
}

impl Drop for ChrootScope {
    fn drop(&mut self) {
        for problem in self.restore_resolv_conf() {
            warn!("{}", problem);
        }
        for target in self.bound.iter().rev() {
            if let Err(e) = Cmd::new("umount").arg_path(target).run() {
                warn!("releasing {}: {:#}", target.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::os::unix::process::ExitStatusExt;
    use tempfile::TempDir;

    struct Scripted {
        exit_code: i32,
        seen: RefCell<Vec<String>>,
    }

    impl ChrootRunner for Scripted {
        fn status(&self, _root: &Path, command: &ChrootCommand) -> anyhow::Result<ExitStatus> {
            self.seen.borrow_mut().push(command.display());
            Ok(ExitStatus::from_raw(self.exit_code << 8))
        }
    }

    #[test]
    fn test_command_display() {
        let cmd = ChrootCommand::new("pacman").args(["-S", "--needed", "--noconfirm", "vim"]);
        assert_eq!(cmd.display(), "pacman -S --needed --noconfirm vim");
    }

    #[test]
    fn test_nonzero_exit_names_command() {
        let runner = Scripted {
            exit_code: 1,
            seen: RefCell::new(Vec::new()),
        };
        let exec = ChrootExecutor::new(&runner, Path::new("/mnt"));
        let err = exec
            .run(&ChrootCommand::new("locale-gen"))
            .unwrap_err();
        match err {
            BuildError::ChrootExecution { command, .. } => assert_eq!(command, "locale-gen"),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(runner.seen.borrow().len(), 1);
    }

    #[test]
    fn test_success_passes_through() {
        let runner = Scripted {
            exit_code: 0,
            seen: RefCell::new(Vec::new()),
        };
        let exec = ChrootExecutor::new(&runner, Path::new("/mnt"));
        exec.run(&ChrootCommand::new("true")).unwrap();
    }

    fn swapped_scope(root: &Path) -> ChrootScope {
        ChrootScope {
            root: root.to_path_buf(),
            bound: Vec::new(),
            resolv_swapped: true,
        }
    }

    #[test]
    fn test_restore_puts_image_resolv_conf_back() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("etc")).unwrap();
        fs::write(temp.path().join(RESOLV_CONF), "nameserver 10.0.0.1\n").unwrap();
        std::os::unix::fs::symlink(
            "/run/systemd/resolve/stub-resolv.conf",
            temp.path().join(RESOLV_BACKUP),
        )
        .unwrap();

        let mut scope = swapped_scope(temp.path());
        assert!(scope.restore_resolv_conf().is_empty());
        assert_eq!(
            fs::read_link(temp.path().join(RESOLV_CONF)).unwrap(),
            PathBuf::from("/run/systemd/resolve/stub-resolv.conf")
        );
        assert!(scope.restore_resolv_conf().is_empty());
    }

    #[test]
    fn test_restore_reports_copy_it_cannot_remove() {
        let temp = TempDir::new().unwrap();
        // A directory where the copied file should be cannot be unlinked.
        fs::create_dir_all(temp.path().join(RESOLV_CONF).join("stale")).unwrap();

        let mut scope = swapped_scope(temp.path());
        let problems = scope.restore_resolv_conf();
        assert_eq!(problems.len(), 1);
        assert!(problems[0].starts_with("removing copied"), "{:?}", problems);
    }

    #[test]
    fn test_restore_tolerates_missing_copy() {
        let temp = TempDir::new().unwrap();
        let mut scope = swapped_scope(temp.path());
        assert!(scope.restore_resolv_conf().is_empty());
    }
}
