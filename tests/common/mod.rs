//! Recording test doubles for every host collaborator.
//!
//! All doubles append to one shared event log so tests can assert on the
//! relative order of device, mount and chroot operations.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs::{self, File};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::rc::Rc;

use flate2::write::GzEncoder;
use flate2::Compression;
use rpi_image_builder::chroot::{ChrootCommand, ChrootRunner};
use rpi_image_builder::config::{ByteSize, HostInfo};
use rpi_image_builder::device::{BlockDeviceDriver, Formatter, Partition};
use rpi_image_builder::fetch::digest::sha256_file;
use rpi_image_builder::fetch::Fetcher;
use rpi_image_builder::mount::Mounter;
use rpi_image_builder::packages::Pacman;
use rpi_image_builder::{BuildConfig, BuildError, CancelFlag, ConfigResolver, Toolchain};
use tempfile::TempDir;

pub type Log = Rc<RefCell<Vec<String>>>;

pub const LOOP_DEVICE: &str = "/dev/loop7";
pub const BASE_URL: &str = "https://images.example.invalid/ArchLinuxARM-rpi-aarch64-latest.tar.gz";

pub struct FakeDriver {
    pub log: Log,
}

impl BlockDeviceDriver for FakeDriver {
    fn attach(&self, image: &Path) -> anyhow::Result<PathBuf> {
        self.log
            .borrow_mut()
            .push(format!("attach {}", image.file_name().unwrap().to_string_lossy()));
        Ok(PathBuf::from(LOOP_DEVICE))
    }

    fn detach(&self, device: &Path) -> anyhow::Result<()> {
        self.log.borrow_mut().push(format!("detach {}", device.display()));
        Ok(())
    }

    fn write_partition_table(&self, _device: &Path, script: &str) -> anyhow::Result<()> {
        let entries = script.lines().filter(|l| l.starts_with("start=")).count();
        self.log.borrow_mut().push(format!("partition {}", entries));
        Ok(())
    }

    fn rescan(&self, _device: &Path) -> anyhow::Result<()> {
        Ok(())
    }

    fn node_exists(&self, _node: &Path) -> bool {
        true
    }
}

pub struct FakeFormatter {
    pub log: Log,
}

impl Formatter for FakeFormatter {
    fn format(&self, partition: &Partition) -> anyhow::Result<()> {
        self.log.borrow_mut().push(format!(
            "format {} {}",
            partition.label,
            partition.kind.mount_type()
        ));
        Ok(())
    }
}

pub struct FakeMounter {
    pub log: Log,
    /// Unmounting boot fails when set.
    pub boot_busy: bool,
}

fn mount_name(target: &Path) -> &'static str {
    if target.ends_with("boot") {
        "boot"
    } else {
        "root"
    }
}

impl Mounter for FakeMounter {
    fn mount(&self, _source: &Path, target: &Path, _fstype: &str) -> anyhow::Result<()> {
        self.log.borrow_mut().push(format!("mount {}", mount_name(target)));
        Ok(())
    }

    fn unmount(&self, target: &Path) -> anyhow::Result<()> {
        let name = mount_name(target);
        self.log.borrow_mut().push(format!("umount {}", name));
        if self.boot_busy && name == "boot" {
            anyhow::bail!("umount: {}: target is busy", target.display());
        }
        Ok(())
    }
}

/// Records commands and fakes what pacman would leave behind.
pub struct FakeChroot {
    pub log: Log,
    pub fail_on: Option<String>,
    pub cancel_on: Option<(String, CancelFlag)>,
}

impl ChrootRunner for FakeChroot {
    fn status(&self, root: &Path, command: &ChrootCommand) -> anyhow::Result<ExitStatus> {
        let line = command.display();
        let entry = match &command.stdin {
            Some(input) => format!("chroot {} <<< {}", line, input),
            None => format!("chroot {}", line),
        };
        self.log.borrow_mut().push(entry);

        if let Some((trigger, flag)) = &self.cancel_on {
            if line.starts_with(trigger.as_str()) {
                flag.cancel();
            }
        }
        if self.fail_on.as_deref().is_some_and(|f| line.starts_with(f)) {
            return Ok(ExitStatus::from_raw(1 << 8));
        }

        if command.program == "pacman" && command.args.first().map(String::as_str) == Some("-S") {
            let image = if command.args.iter().any(|a| a == "linux-rpi-16k") {
                Some("boot/kernel_2712.img")
            } else if command.args.iter().any(|a| a == "linux-rpi") {
                Some("boot/kernel8.img")
            } else {
                None
            };
            if let Some(image) = image {
                let path = root.join(image);
                fs::create_dir_all(path.parent().unwrap())?;
                fs::write(path, b"kernel")?;
            }
        }
        Ok(ExitStatus::from_raw(0))
    }
}

pub struct FakeFetcher {
    pub log: Log,
    pub files: HashMap<String, Vec<u8>>,
}

impl Fetcher for FakeFetcher {
    fn fetch(&self, url: &str, dest: &Path) -> rpi_image_builder::Result<()> {
        self.log.borrow_mut().push(format!("fetch {}", url));
        match self.files.get(url) {
            Some(bytes) => {
                fs::write(dest, bytes).map_err(|e| BuildError::Download {
                    url: url.to_string(),
                    source: e.into(),
                })?;
                Ok(())
            }
            None => Err(BuildError::Download {
                url: url.to_string(),
                source: anyhow::anyhow!("404 Not Found"),
            }),
        }
    }

    fn fetch_text(&self, url: &str) -> rpi_image_builder::Result<String> {
        self.log.borrow_mut().push(format!("fetch {}", url));
        self.files
            .get(url)
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .ok_or_else(|| BuildError::Download {
                url: url.to_string(),
                source: anyhow::anyhow!("404 Not Found"),
            })
    }
}

/// A small but real base archive.
pub fn write_base_archive(path: &Path) {
    let file = File::create(path).unwrap();
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::fast()));
    let entries = [
        ("etc/fstab", "/dev/mmcblk0p1  /boot   vfat    defaults        0       0\n"),
        ("etc/locale.gen", "#en_US.UTF-8 UTF-8\n"),
        ("boot/cmdline.txt", "root=/dev/mmcblk0p2 rw rootwait console=tty1\n"),
        ("boot/config.txt", "arm_64bit=1\n"),
    ];
    for (name, body) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(0o644);
        header.set_uid(unsafe { libc::getuid() } as u64);
        header.set_gid(unsafe { libc::getgid() } as u64);
        header.set_cksum();
        builder.append_data(&mut header, name, body.as_bytes()).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap();
}

/// One build's worth of fakes, config and scratch space.
pub struct Harness {
    pub temp: TempDir,
    pub log: Log,
    pub config: BuildConfig,
    pub files: HashMap<String, Vec<u8>>,
    pub chroot_fail_on: Option<String>,
    pub cancel_on: Option<(String, CancelFlag)>,
    pub boot_busy: bool,
}

impl Harness {
    /// A harness on an aarch64 host, so no emulation shim is needed.
    pub fn new() -> Self {
        Self::for_arch("aarch64")
    }

    pub fn for_arch(arch: &str) -> Self {
        let temp = TempDir::new().unwrap();
        let resolver = ConfigResolver::new(HostInfo {
            arch: arch.to_string(),
            temp_dir: temp.path().join("tmp"),
        });
        let mut config = resolver.validate(resolver.defaults()).unwrap();
        // Small image; the fakes never look inside it.
        config.image_size = ByteSize::mib(64);
        config.boot_size = ByteSize::mib(16);
        config.output_dir = temp.path().join("output");
        config.base_url = BASE_URL.to_string();
        config.digest_url = format!("{}.sha256", BASE_URL);

        let archive = temp.path().join("base.tar.gz");
        write_base_archive(&archive);
        let (sha, _) = sha256_file(&archive).unwrap();
        let mut files = HashMap::new();
        files.insert(BASE_URL.to_string(), fs::read(&archive).unwrap());
        files.insert(
            config.digest_url.clone(),
            format!("{}  ArchLinuxARM-rpi-aarch64-latest.tar.gz\n", sha).into_bytes(),
        );

        Self {
            temp,
            log: Log::default(),
            config,
            files,
            chroot_fail_on: None,
            cancel_on: None,
            boot_busy: false,
        }
    }

    pub fn toolchain(&self) -> Toolchain {
        Toolchain {
            devices: Box::new(FakeDriver {
                log: self.log.clone(),
            }),
            formatter: Box::new(FakeFormatter {
                log: self.log.clone(),
            }),
            mounter: Box::new(FakeMounter {
                log: self.log.clone(),
                boot_busy: self.boot_busy,
            }),
            chroot: Box::new(FakeChroot {
                log: self.log.clone(),
                fail_on: self.chroot_fail_on.clone(),
                cancel_on: self.cancel_on.clone(),
            }),
            packages: Box::new(Pacman),
            fetcher: Box::new(FakeFetcher {
                log: self.log.clone(),
                files: self.files.clone(),
            }),
        }
    }

    pub fn events(&self) -> Vec<String> {
        self.log.borrow().clone()
    }

    pub fn count(&self, event: &str) -> usize {
        self.log.borrow().iter().filter(|e| e.as_str() == event).count()
    }

    pub fn position(&self, event: &str) -> Option<usize> {
        self.log.borrow().iter().position(|e| e == event)
    }

    /// Workspace directories created under the default prefix.
    pub fn workspaces(&self) -> Vec<PathBuf> {
        let base = self.config.default_workdir.clone();
        match fs::read_dir(&base) {
            Ok(entries) => entries.filter_map(|e| e.ok()).map(|e| e.path()).collect(),
            Err(_) => Vec::new(),
        }
    }
}
