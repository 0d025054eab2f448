//! Provisioning stages run against the mounted image.
//!
//! A [`Stage`] is a name, a skip predicate and an action. [`Pipeline`] runs
//! them in order, checks for an interrupt before each one, and stops at the
//! first failure. Nothing is retried and nothing is rolled back: the
//! cleanup controller owns recovery.

mod identity;
mod network;
mod system;

use log::info;
use serde::Serialize;
use std::path::Path;

use crate::chroot::ChrootExecutor;
use crate::cleanup::CancelFlag;
use crate::config::BuildConfig;
use crate::error::{BuildError, Result};
use crate::fetch::Fetcher;
use crate::packages::PackageManager;

pub use identity::generate_password;

/// Everything a stage may read.
pub struct StageContext<'a> {
    /// Mount point of the root partition; boot is mounted at `root/boot`.
    pub root: &'a Path,
    pub config: &'a BuildConfig,
    /// Verified base archive.
    pub archive: &'a Path,
    pub chroot: ChrootExecutor<'a>,
    pub packages: &'a dyn PackageManager,
    pub fetcher: &'a dyn Fetcher,
    pub root_password: &'a str,
}

type SkipFn = fn(&StageContext<'_>) -> Option<String>;
type ActionFn = fn(&StageContext<'_>) -> anyhow::Result<()>;

pub struct Stage {
    pub name: &'static str,
    skip: SkipFn,
    action: ActionFn,
}

impl Stage {
    pub fn new(name: &'static str, action: ActionFn) -> Self {
        Self {
            name,
            skip: never,
            action,
        }
    }

    pub fn skip_when(mut self, skip: SkipFn) -> Self {
        self.skip = skip;
        self
    }

    pub fn skip_reason(&self, ctx: &StageContext<'_>) -> Option<String> {
        (self.skip)(ctx)
    }
}

fn never(_: &StageContext<'_>) -> Option<String> {
    None
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "lowercase")]
pub enum StageOutcome {
    Ran,
    Skipped(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageRecord {
    pub ordinal: usize,
    pub name: &'static str,
    #[serde(flatten)]
    pub outcome: StageOutcome,
}

pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new(stages: Vec<Stage>) -> Self {
        Self { stages }
    }

    /// The full Raspberry Pi provisioning sequence.
    pub fn standard() -> Self {
        Self::new(vec![
            Stage::new("extract-base", system::extract_base),
            Stage::new("install-emulation-shim", system::install_emulation)
                .skip_when(system::native_host),
            Stage::new("package-keyring", system::package_keyring),
            Stage::new("kernel-firmware", system::kernel_firmware),
            Stage::new("extra-packages", system::extra_packages)
                .skip_when(system::no_extra_packages),
            Stage::new("fstab", system::fstab),
            Stage::new("locale", identity::locale),
            Stage::new("keymap", identity::keymap),
            Stage::new("timezone", identity::timezone),
            Stage::new("hostname", identity::hostname),
            Stage::new("root-password", identity::root_password),
            Stage::new("network", network::wired),
            Stage::new("ssh", network::ssh),
            Stage::new("wifi", network::wifi).skip_when(network::no_wifi),
            Stage::new("zerotier", network::zerotier).skip_when(network::no_zerotier),
            Stage::new("usb-console", network::usb_console)
                .skip_when(network::usb_console_disabled),
            Stage::new("system-update", system::system_update),
            Stage::new("remove-emulation-shim", system::remove_emulation)
                .skip_when(system::native_host),
        ])
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name).collect()
    }

    /// Run every stage in order.
    pub fn run(&self, ctx: &StageContext<'_>, cancel: &CancelFlag) -> Result<Vec<StageRecord>> {
        let total = self.stages.len();
        let mut records = Vec::with_capacity(total);
        for (i, stage) in self.stages.iter().enumerate() {
            cancel.check()?;
            let ordinal = i + 1;
            let outcome = match stage.skip_reason(ctx) {
                Some(reason) => {
                    info!("[{}/{}] {}: skipped ({})", ordinal, total, stage.name, reason);
                    StageOutcome::Skipped(reason)
                }
                None => {
                    println!("[{}/{}] {}", ordinal, total, stage.name);
                    (stage.action)(ctx).map_err(|source| BuildError::Stage {
                        stage: stage.name,
                        source,
                    })?;
                    StageOutcome::Ran
                }
            };
            records.push(StageRecord {
                ordinal,
                name: stage.name,
                outcome,
            });
        }
        Ok(records)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::chroot::{ChrootCommand, ChrootRunner};
    use crate::config::{ConfigResolver, HostInfo, WifiCredentials};
    use crate::packages::Pacman;
    use std::cell::RefCell;
    use std::os::unix::process::ExitStatusExt;
    use std::path::PathBuf;
    use std::process::ExitStatus;

    #[derive(Default)]
    pub(crate) struct RecordingChroot(pub RefCell<Vec<String>>);

    impl ChrootRunner for RecordingChroot {
        fn status(&self, _root: &Path, command: &ChrootCommand) -> anyhow::Result<ExitStatus> {
            let mut line = command.display();
            if let Some(input) = &command.stdin {
                line.push_str(&format!(" <<< {}", input.trim_end()));
            }
            self.0.borrow_mut().push(line);
            Ok(ExitStatus::from_raw(0))
        }
    }

    pub(crate) struct NoNetwork;

    impl Fetcher for NoNetwork {
        fn fetch(&self, url: &str, _dest: &Path) -> Result<()> {
            Err(BuildError::Download {
                url: url.to_string(),
                source: anyhow::anyhow!("offline"),
            })
        }

        fn fetch_text(&self, url: &str) -> Result<String> {
            self.fetch(url, Path::new("/dev/null")).map(|_| String::new())
        }
    }

    pub(crate) fn config() -> BuildConfig {
        let resolver = ConfigResolver::new(HostInfo {
            arch: "x86_64".into(),
            temp_dir: PathBuf::from("/tmp"),
        });
        resolver.validate(resolver.defaults()).unwrap()
    }

    pub(crate) fn context<'a>(
        root: &'a Path,
        config: &'a BuildConfig,
        runner: &'a RecordingChroot,
    ) -> StageContext<'a> {
        StageContext {
            root,
            config,
            archive: Path::new("/nonexistent/base.tar.gz"),
            chroot: ChrootExecutor::new(runner, root),
            packages: &Pacman,
            fetcher: &NoNetwork,
            root_password: "Secret123",
        }
    }

    fn ok(_: &StageContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    fn boom(_: &StageContext<'_>) -> anyhow::Result<()> {
        anyhow::bail!("boom")
    }

    fn always(_: &StageContext<'_>) -> Option<String> {
        Some("not wanted".into())
    }

    #[test]
    fn test_standard_order() {
        let names = Pipeline::standard().names();
        assert_eq!(names.len(), 18);
        assert_eq!(names[0], "extract-base");
        assert_eq!(names[1], "install-emulation-shim");
        assert_eq!(names[16], "system-update");
        assert_eq!(names[17], "remove-emulation-shim");
        let pos = |n: &str| names.iter().position(|x| *x == n).unwrap();
        assert!(pos("kernel-firmware") < pos("extra-packages"));
        assert!(pos("network") < pos("wifi"));
    }

    #[test]
    fn test_failure_stops_pipeline_and_names_stage() {
        let root = tempfile::TempDir::new().unwrap();
        let config = config();
        let runner = RecordingChroot::default();
        let ctx = context(root.path(), &config, &runner);
        let pipeline = Pipeline::new(vec![
            Stage::new("first", ok),
            Stage::new("second", boom),
            Stage::new("third", ok),
        ]);
        let err = pipeline.run(&ctx, &CancelFlag::new()).unwrap_err();
        assert_eq!(err.failed_stage(), Some("second"));
    }

    #[test]
    fn test_skips_are_recorded() {
        let root = tempfile::TempDir::new().unwrap();
        let config = config();
        let runner = RecordingChroot::default();
        let ctx = context(root.path(), &config, &runner);
        let pipeline = Pipeline::new(vec![
            Stage::new("a", ok),
            Stage::new("b", boom).skip_when(always),
        ]);
        let records = pipeline.run(&ctx, &CancelFlag::new()).unwrap();
        assert_eq!(records[0].outcome, StageOutcome::Ran);
        assert_eq!(records[1].outcome, StageOutcome::Skipped("not wanted".into()));
        assert_eq!(records[1].ordinal, 2);
    }

    #[test]
    fn test_cancel_before_stage() {
        let root = tempfile::TempDir::new().unwrap();
        let config = config();
        let runner = RecordingChroot::default();
        let ctx = context(root.path(), &config, &runner);
        let cancel = CancelFlag::new();
        cancel.cancel();
        let err = Pipeline::new(vec![Stage::new("a", boom)])
            .run(&ctx, &cancel)
            .unwrap_err();
        assert!(matches!(err, BuildError::Interrupted));
    }

    #[test]
    fn test_wifi_and_zerotier_predicates() {
        let root = tempfile::TempDir::new().unwrap();
        let mut config = config();
        let runner = RecordingChroot::default();
        let pipeline = Pipeline::standard();
        let stage = |name: &str| {
            pipeline
                .stages
                .iter()
                .find(|s| s.name == name)
                .unwrap()
        };

        {
            let ctx = context(root.path(), &config, &runner);
            assert!(stage("wifi").skip_reason(&ctx).is_some());
            assert!(stage("zerotier").skip_reason(&ctx).is_some());
        }

        config.wifi = Some(WifiCredentials {
            ssid: "home".into(),
            password: "correct horse".into(),
            country: "US".into(),
        });
        config.zerotier_network = Some("8056c2e21c000001".into());
        let ctx = context(root.path(), &config, &runner);
        assert!(stage("wifi").skip_reason(&ctx).is_none());
        assert!(stage("zerotier").skip_reason(&ctx).is_none());
    }

    #[test]
    fn test_record_serializes_outcome() {
        let record = StageRecord {
            ordinal: 14,
            name: "wifi",
            outcome: StageOutcome::Skipped("no credentials".into()),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["outcome"], "skipped");
        assert_eq!(json["reason"], "no credentials");
        assert_eq!(json["name"], "wifi");
    }
}
