//! Build configuration: defaults, TOML file, environment and flags merged
//! into one immutable [`BuildConfig`].
//!
//! Resolution is a pure transform apart from reading the optional config
//! file. Every validation failure names the offending field and happens
//! before any host resource is touched.

pub mod cli;
pub mod layer;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{BuildError, Result};
pub use cli::{parse_args, usage, CliArgs};
pub use layer::{ConfigLayer, CONFIG_FILE_ENV};

/// Arch Linux ARM generic aarch64 root filesystem for the Raspberry Pi.
pub const DEFAULT_BASE_URL: &str =
    "http://os.archlinuxarm.org/os/ArchLinuxARM-rpi-aarch64-latest.tar.gz";

/// Where the kernel exposes binfmt_misc registrations.
pub const DEFAULT_BINFMT_DIR: &str = "/proc/sys/fs/binfmt_misc";

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Supported Raspberry Pi boards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TargetModel {
    #[serde(rename = "4")]
    Pi4,
    #[serde(rename = "5")]
    Pi5,
}

impl TargetModel {
    pub fn from_number(n: u8) -> Option<Self> {
        match n {
            4 => Some(Self::Pi4),
            5 => Some(Self::Pi5),
            _ => None,
        }
    }

    pub fn number(self) -> u8 {
        match self {
            Self::Pi4 => 4,
            Self::Pi5 => 5,
        }
    }
}

impl fmt::Display for TargetModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.number())
    }
}

/// A size in bytes, parsed from strings like `4G`, `512MiB` or `1048576`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(try_from = "String")]
pub struct ByteSize(u64);

impl ByteSize {
    pub const fn bytes(n: u64) -> Self {
        Self(n)
    }

    pub const fn mib(n: u64) -> Self {
        Self(n * MIB)
    }

    pub const fn gib(n: u64) -> Self {
        Self(n * GIB)
    }

    pub fn as_bytes(self) -> u64 {
        self.0
    }

    pub fn as_mib(self) -> u64 {
        self.0 / MIB
    }
}

impl FromStr for ByteSize {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        let split = s
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(s.len());
        let (digits, unit) = s.split_at(split);
        if digits.is_empty() {
            return Err(format!("'{}' does not start with a number", s));
        }
        let n: u64 = digits
            .parse()
            .map_err(|e| format!("'{}': {}", digits, e))?;
        let multiplier = match unit.to_ascii_uppercase().as_str() {
            "" | "B" => 1,
            "K" | "KB" | "KIB" => 1024,
            "M" | "MB" | "MIB" => MIB,
            "G" | "GB" | "GIB" => GIB,
            "T" | "TB" | "TIB" => 1024 * GIB,
            other => return Err(format!("unknown size unit '{}'", other)),
        };
        n.checked_mul(multiplier)
            .map(ByteSize)
            .ok_or_else(|| format!("'{}' overflows", s))
    }
}

impl TryFrom<String> for ByteSize {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= GIB && self.0 % GIB == 0 {
            write!(f, "{}GiB", self.0 / GIB)
        } else if self.0 >= MIB && self.0 % MIB == 0 {
            write!(f, "{}MiB", self.0 / MIB)
        } else {
            write!(f, "{}B", self.0)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WifiCredentials {
    pub ssid: String,
    pub password: String,
    pub country: String,
}

/// Cross-architecture execution settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmulationConfig {
    /// False on aarch64 hosts, where target binaries run natively.
    pub required: bool,
    /// Static interpreter on the host, copied into the image.
    pub interpreter: PathBuf,
    pub binfmt_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchPolicy {
    pub attempts: u32,
    pub timeout: Duration,
    pub retry_delay: Duration,
}

/// Host facts the resolver needs; injected so resolution stays pure.
#[derive(Debug, Clone)]
pub struct HostInfo {
    pub arch: String,
    pub temp_dir: PathBuf,
}

impl HostInfo {
    pub fn current() -> Self {
        Self {
            arch: std::env::consts::ARCH.to_string(),
            temp_dir: std::env::temp_dir(),
        }
    }
}

/// Resolved, immutable build parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildConfig {
    pub model: TargetModel,
    pub image_size: ByteSize,
    pub boot_size: ByteSize,
    pub hostname: String,
    pub timezone: String,
    pub locale: String,
    pub keymap: String,
    pub packages: Vec<String>,
    pub ssh_key_urls: Vec<String>,
    pub ssh_port: u16,
    pub wifi: Option<WifiCredentials>,
    pub zerotier_network: Option<String>,
    pub usb_console: bool,
    pub output_dir: PathBuf,
    /// Operator-chosen workspace base; workspaces under it are never removed.
    pub workdir: Option<PathBuf>,
    /// Default workspace base; only workspaces under it are removed on success.
    pub default_workdir: PathBuf,
    pub keep_resources: bool,
    pub verbose: bool,
    pub base_url: String,
    pub digest_url: String,
    pub emulation: EmulationConfig,
    pub fetch: FetchPolicy,
    /// Problems that did not stop resolution. Logging is not set up yet
    /// while resolving, so the caller reports these.
    pub warnings: Vec<String>,
}

impl BuildConfig {
    /// File stem shared by every output artifact, e.g. `alarmpi-rpi4`.
    pub fn artifact_stem(&self) -> String {
        format!("{}-rpi{}", self.hostname, self.model)
    }
}

/// What the command line asked for.
#[derive(Debug)]
pub enum Invocation {
    Help,
    Build(Box<BuildConfig>),
}

/// Merges defaults, config file, environment and flags.
pub struct ConfigResolver {
    host: HostInfo,
}

impl ConfigResolver {
    pub fn new(host: HostInfo) -> Self {
        Self { host }
    }

    pub fn defaults(&self) -> ConfigLayer {
        ConfigLayer {
            model: Some(4),
            image_size: Some(ByteSize::gib(4)),
            boot_size: Some(ByteSize::mib(512)),
            hostname: Some("alarmpi".into()),
            output_dir: Some(PathBuf::from("output")),
            keep: Some(false),
            verbose: Some(false),
            timezone: Some("UTC".into()),
            locale: Some("en_US.UTF-8".into()),
            keymap: Some("us".into()),
            packages: Some(Vec::new()),
            ssh_key_urls: Some(Vec::new()),
            ssh_port: Some(22),
            wifi_country: Some("US".into()),
            usb_console: Some(true),
            base_url: Some(DEFAULT_BASE_URL.into()),
            qemu_static: Some(PathBuf::from("/usr/bin/qemu-aarch64-static")),
            fetch_retries: Some(3),
            fetch_timeout: Some(600),
            ..Default::default()
        }
    }

    /// Resolve an invocation from the program arguments (without argv[0])
    /// and the process environment.
    pub fn resolve(&self, args: &[String], env: &HashMap<String, String>) -> Result<Invocation> {
        let cli = parse_args(args)?;
        if cli.help {
            return Ok(Invocation::Help);
        }

        let file_path = cli.config_file.clone().or_else(|| {
            env.get(CONFIG_FILE_ENV)
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
        });
        let file_layer = match file_path {
            Some(path) => ConfigLayer::from_file(&path)?,
            None => ConfigLayer::default(),
        };
        let env_layer = ConfigLayer::from_env(env)?;

        let merged = self
            .defaults()
            .overlay(file_layer)
            .overlay(env_layer)
            .overlay(cli.layer);
        self.validate(merged).map(|c| Invocation::Build(Box::new(c)))
    }

    /// Turn a fully merged layer into a validated configuration.
    pub fn validate(&self, layer: ConfigLayer) -> Result<BuildConfig> {
        let model_number = required(layer.model, "model")?;
        let model = TargetModel::from_number(model_number).ok_or_else(|| {
            BuildError::validation(
                "model",
                format!("unsupported model {}; expected 4 or 5", model_number),
            )
        })?;

        let image_size = required(layer.image_size, "image_size")?;
        let boot_size = required(layer.boot_size, "boot_size")?;
        validate_sizes(image_size, boot_size)?;

        let hostname = required(layer.hostname, "hostname")?;
        validate_hostname(&hostname)?;
        let timezone = required(layer.timezone, "timezone")?;
        validate_timezone(&timezone)?;
        let locale = required(layer.locale, "locale")?;
        validate_token(&locale, "locale")?;
        let keymap = required(layer.keymap, "keymap")?;
        validate_token(&keymap, "keymap")?;

        let packages = layer.packages.unwrap_or_default();
        for package in &packages {
            if package.starts_with('-') || package.chars().any(char::is_whitespace) {
                return Err(BuildError::validation(
                    "packages",
                    format!("'{}' is not a package name", package),
                ));
            }
        }

        let ssh_key_urls = layer.ssh_key_urls.unwrap_or_default();
        for url in &ssh_key_urls {
            validate_url(url, "ssh_key_urls")?;
        }

        let ssh_port = required(layer.ssh_port, "ssh_port")?;
        if ssh_port == 0 {
            return Err(BuildError::validation("ssh_port", "port 0 is not usable"));
        }

        let mut warnings = Vec::new();
        let wifi = resolve_wifi(
            layer.wifi_ssid,
            layer.wifi_password,
            layer.wifi_country,
            &mut warnings,
        )?;

        let zerotier_network = layer.zerotier_network;
        if let Some(id) = &zerotier_network {
            if id.len() != 16 || !id.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(BuildError::validation(
                    "zerotier_network",
                    format!("'{}' is not a 16-digit hex network id", id),
                ));
            }
        }

        let base_url = required(layer.base_url, "base_url")?;
        validate_url(&base_url, "base_url")?;
        let digest_url = layer
            .digest_url
            .unwrap_or_else(|| format!("{}.sha256", base_url));
        validate_url(&digest_url, "digest_url")?;

        let attempts = required(layer.fetch_retries, "fetch_retries")?;
        if attempts == 0 {
            return Err(BuildError::validation(
                "fetch_retries",
                "at least one attempt is required",
            ));
        }
        let timeout = required(layer.fetch_timeout, "fetch_timeout")?;
        if timeout == 0 {
            return Err(BuildError::validation(
                "fetch_timeout",
                "timeout must be positive",
            ));
        }

        Ok(BuildConfig {
            model,
            image_size,
            boot_size,
            hostname,
            timezone,
            locale,
            keymap,
            packages,
            ssh_key_urls,
            ssh_port,
            wifi,
            zerotier_network,
            usb_console: layer.usb_console.unwrap_or(true),
            output_dir: required(layer.output_dir, "output_dir")?,
            workdir: layer.workdir,
            default_workdir: self.host.temp_dir.join("rpi-image-builder"),
            keep_resources: layer.keep.unwrap_or(false),
            verbose: layer.verbose.unwrap_or(false),
            base_url,
            digest_url,
            emulation: EmulationConfig {
                required: self.host.arch != "aarch64",
                interpreter: required(layer.qemu_static, "qemu_static")?,
                binfmt_dir: PathBuf::from(DEFAULT_BINFMT_DIR),
            },
            fetch: FetchPolicy {
                attempts,
                timeout: Duration::from_secs(timeout),
                retry_delay: Duration::from_secs(2),
            },
            warnings,
        })
    }
}

fn required<T>(value: Option<T>, field: &str) -> Result<T> {
    value.ok_or_else(|| BuildError::validation(field, "no value configured"))
}

fn validate_sizes(image: ByteSize, boot: ByteSize) -> Result<()> {
    if image.as_bytes() % MIB != 0 {
        return Err(BuildError::validation(
            "image_size",
            format!("{} is not a whole number of MiB", image),
        ));
    }
    if boot.as_bytes() % MIB != 0 {
        return Err(BuildError::validation(
            "boot_size",
            format!("{} is not a whole number of MiB", boot),
        ));
    }
    if boot < ByteSize::mib(32) {
        return Err(BuildError::validation(
            "boot_size",
            format!("{} is below the 32MiB FAT32 minimum", boot),
        ));
    }
    // 1 MiB alignment gap in front of partition 1, at least 1 GiB of root.
    let minimum = boot.as_bytes().checked_add(MIB + GIB).ok_or_else(|| {
        BuildError::validation("boot_size", format!("{} is larger than any image", boot))
    })?;
    if image.as_bytes() < minimum {
        return Err(BuildError::validation(
            "image_size",
            format!(
                "{} leaves no room for a root partition after {} of boot",
                image, boot
            ),
        ));
    }
    Ok(())
}

fn validate_hostname(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && !name.starts_with('-')
        && !name.ends_with('-')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
    if !valid {
        return Err(BuildError::validation(
            "hostname",
            format!("'{}' is not a valid RFC 1123 host label", name),
        ));
    }
    Ok(())
}

fn validate_timezone(tz: &str) -> Result<()> {
    let valid = !tz.is_empty()
        && !tz.starts_with('/')
        && !tz.split('/').any(|part| part.is_empty() || part == "..")
        && tz
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '_' | '-' | '+'));
    if !valid {
        return Err(BuildError::validation(
            "timezone",
            format!("'{}' is not a zoneinfo name", tz),
        ));
    }
    Ok(())
}

fn validate_token(value: &str, field: &str) -> Result<()> {
    if value.is_empty() || value.contains('/') || value.chars().any(char::is_whitespace) {
        return Err(BuildError::validation(
            field,
            format!("'{}' must be a single word without '/'", value),
        ));
    }
    Ok(())
}

fn validate_url(url: &str, field: &str) -> Result<()> {
    if ["http://", "https://", "file://"]
        .iter()
        .any(|scheme| url.starts_with(scheme))
    {
        return Ok(());
    }
    Err(BuildError::validation(
        field,
        format!("'{}' must be an http(s):// or file:// URL", url),
    ))
}

fn resolve_wifi(
    ssid: Option<String>,
    password: Option<String>,
    country: Option<String>,
    warnings: &mut Vec<String>,
) -> Result<Option<WifiCredentials>> {
    let (ssid, password) = match (ssid, password) {
        (Some(ssid), Some(password)) => (ssid, password),
        (None, None) => return Ok(None),
        (Some(_), None) | (None, Some(_)) => {
            warnings.push(
                "WiFi needs both RPI_WIFI_SSID and RPI_WIFI_PASSWORD; WiFi stays unconfigured"
                    .to_string(),
            );
            return Ok(None);
        }
    };

    if ssid.is_empty() || ssid.len() > 32 {
        return Err(BuildError::validation(
            "wifi_ssid",
            "SSID must be 1 to 32 bytes",
        ));
    }
    let printable = password.chars().all(|c| c.is_ascii() && !c.is_ascii_control());
    if !(8..=63).contains(&password.len()) || !printable {
        return Err(BuildError::validation(
            "wifi_password",
            "WPA passphrase must be 8 to 63 printable ASCII characters",
        ));
    }
    let country = country.unwrap_or_else(|| "US".to_string());
    if country.len() != 2 || !country.chars().all(|c| c.is_ascii_uppercase()) {
        return Err(BuildError::validation(
            "wifi_country",
            format!("'{}' is not a two-letter country code", country),
        ));
    }

    Ok(Some(WifiCredentials {
        ssid,
        password,
        country,
    }))
}

/// True when `path` lies under `prefix` after normalizing both.
pub(crate) fn is_under(path: &Path, prefix: &Path) -> bool {
    path.components().count() > prefix.components().count() && path.starts_with(prefix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn resolver() -> ConfigResolver {
        ConfigResolver::new(HostInfo {
            arch: "x86_64".into(),
            temp_dir: PathBuf::from("/tmp"),
        })
    }

    fn build(args: &[&str], env: &[(&str, &str)]) -> Result<BuildConfig> {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        let env: HashMap<String, String> = env
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        match resolver().resolve(&args, &env)? {
            Invocation::Build(config) => Ok(*config),
            Invocation::Help => panic!("unexpected help"),
        }
    }

    fn field_of(err: BuildError) -> String {
        match err {
            BuildError::Validation { field, .. } => field,
            other => panic!("expected validation error, got {other}"),
        }
    }

    #[test]
    fn test_defaults_resolve() {
        let config = build(&[], &[]).unwrap();
        assert_eq!(config.model, TargetModel::Pi4);
        assert_eq!(config.image_size, ByteSize::gib(4));
        assert_eq!(config.boot_size, ByteSize::mib(512));
        assert_eq!(config.hostname, "alarmpi");
        assert_eq!(config.digest_url, format!("{}.sha256", DEFAULT_BASE_URL));
        assert!(config.emulation.required);
        assert!(config.usb_console);
        assert_eq!(config.wifi, None);
        assert_eq!(
            config.default_workdir,
            PathBuf::from("/tmp/rpi-image-builder")
        );
    }

    #[test]
    fn test_model_outside_supported_set_rejected() {
        for bad in ["3", "6", "0"] {
            let err = build(&["--model", bad], &[]).unwrap_err();
            assert_eq!(field_of(err), "model");
        }
        assert_eq!(build(&["-m", "5"], &[]).unwrap().model, TargetModel::Pi5);
    }

    #[test]
    fn test_flags_override_environment() {
        let config = build(
            &["--hostname", "fromflag"],
            &[("RPI_HOSTNAME", "fromenv"), ("RPI_TIMEZONE", "Europe/Berlin")],
        )
        .unwrap();
        assert_eq!(config.hostname, "fromflag");
        assert_eq!(config.timezone, "Europe/Berlin");
    }

    #[test]
    fn test_environment_overrides_config_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("pi.toml");
        fs::write(&path, "hostname = \"fromfile\"\nlocale = \"de_DE.UTF-8\"\n").unwrap();
        let config = build(
            &["--config", path.to_str().unwrap()],
            &[("RPI_HOSTNAME", "fromenv")],
        )
        .unwrap();
        assert_eq!(config.hostname, "fromenv");
        assert_eq!(config.locale, "de_DE.UTF-8");
    }

    #[test]
    fn test_size_validation() {
        assert_eq!(field_of(build(&["-s", "1G"], &[]).unwrap_err()), "image_size");
        assert_eq!(
            field_of(build(&["--boot-size", "16M"], &[]).unwrap_err()),
            "boot_size"
        );
        assert_eq!(
            field_of(build(&["-s", "4097K"], &[]).unwrap_err()),
            "image_size"
        );
        assert!(build(&["-s", "2G", "--boot-size", "256M"], &[]).is_ok());
    }

    #[test]
    fn test_boot_size_near_u64_max_is_rejected() {
        let err = build(&["--boot-size", "17179869183G"], &[]).unwrap_err();
        assert_eq!(field_of(err), "boot_size");
    }

    #[test]
    fn test_wifi_requires_both_credentials() {
        let partial = build(&[], &[("RPI_WIFI_SSID", "home")]).unwrap();
        assert_eq!(partial.wifi, None);
        assert_eq!(partial.warnings.len(), 1);
        assert!(partial.warnings[0].contains("RPI_WIFI_PASSWORD"));

        let full = build(
            &[],
            &[("RPI_WIFI_SSID", "home"), ("RPI_WIFI_PASSWORD", "hunter22!")],
        )
        .unwrap();
        assert!(full.warnings.is_empty());
        let wifi = full.wifi.unwrap();
        assert_eq!(wifi.ssid, "home");
        assert_eq!(wifi.country, "US");

        let short = build(
            &[],
            &[("RPI_WIFI_SSID", "home"), ("RPI_WIFI_PASSWORD", "short")],
        )
        .unwrap_err();
        assert_eq!(field_of(short), "wifi_password");
    }

    #[test]
    fn test_zerotier_network_id_format() {
        let err = build(&[], &[("RPI_ZEROTIER_NETWORK", "not-hex")]).unwrap_err();
        assert_eq!(field_of(err), "zerotier_network");
        let ok = build(&[], &[("RPI_ZEROTIER_NETWORK", "8056c2e21c000001")]).unwrap();
        assert_eq!(ok.zerotier_network.as_deref(), Some("8056c2e21c000001"));
    }

    #[test]
    fn test_hostname_and_timezone_validation() {
        assert_eq!(
            field_of(build(&["-n", "bad_host"], &[]).unwrap_err()),
            "hostname"
        );
        assert_eq!(
            field_of(build(&[], &[("RPI_TIMEZONE", "../etc/passwd")]).unwrap_err()),
            "timezone"
        );
    }

    #[test]
    fn test_native_host_needs_no_emulation() {
        let resolver = ConfigResolver::new(HostInfo {
            arch: "aarch64".into(),
            temp_dir: PathBuf::from("/tmp"),
        });
        let config = resolver.validate(resolver.defaults()).unwrap();
        assert!(!config.emulation.required);
    }

    #[test]
    fn test_help_short_circuits_validation() {
        let args = vec!["--model".to_string(), "9".to_string(), "-h".to_string()];
        let invocation = resolver().resolve(&args, &HashMap::new()).unwrap();
        assert!(matches!(invocation, Invocation::Help));
    }

    #[test]
    fn test_byte_size_parsing() {
        assert_eq!("4G".parse::<ByteSize>().unwrap(), ByteSize::gib(4));
        assert_eq!("512MiB".parse::<ByteSize>().unwrap(), ByteSize::mib(512));
        assert_eq!("1024".parse::<ByteSize>().unwrap(), ByteSize::bytes(1024));
        assert!("G4".parse::<ByteSize>().is_err());
        assert!("4X".parse::<ByteSize>().is_err());
        assert_eq!(ByteSize::gib(4).to_string(), "4GiB");
    }

    #[test]
    fn test_is_under() {
        assert!(is_under(Path::new("/tmp/a/b"), Path::new("/tmp/a")));
        assert!(!is_under(Path::new("/tmp/a"), Path::new("/tmp/a")));
        assert!(!is_under(Path::new("/tmp/ab"), Path::new("/tmp/a")));
    }
}
