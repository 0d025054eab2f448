//! One partial configuration source.
//!
//! Defaults, the TOML file, the environment and the command line each
//! produce a [`ConfigLayer`]; layers are stacked with [`ConfigLayer::overlay`]
//! and the result is validated into a `BuildConfig`.

use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use super::ByteSize;
use crate::error::{BuildError, Result};

/// Environment variable naming an optional TOML configuration file.
pub const CONFIG_FILE_ENV: &str = "RPI_CONFIG";

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigLayer {
    pub model: Option<u8>,
    pub image_size: Option<ByteSize>,
    pub boot_size: Option<ByteSize>,
    pub hostname: Option<String>,
    pub output_dir: Option<PathBuf>,
    pub workdir: Option<PathBuf>,
    pub keep: Option<bool>,
    pub verbose: Option<bool>,
    pub timezone: Option<String>,
    pub locale: Option<String>,
    pub keymap: Option<String>,
    pub packages: Option<Vec<String>>,
    pub ssh_key_urls: Option<Vec<String>>,
    pub ssh_port: Option<u16>,
    pub wifi_ssid: Option<String>,
    pub wifi_password: Option<String>,
    pub wifi_country: Option<String>,
    pub zerotier_network: Option<String>,
    pub usb_console: Option<bool>,
    pub base_url: Option<String>,
    pub digest_url: Option<String>,
    pub qemu_static: Option<PathBuf>,
    pub fetch_retries: Option<u32>,
    pub fetch_timeout: Option<u64>,
}

impl ConfigLayer {
    /// Stack `upper` on top of `self`; values set in `upper` win.
    pub fn overlay(self, upper: ConfigLayer) -> ConfigLayer {
        ConfigLayer {
            model: upper.model.or(self.model),
            image_size: upper.image_size.or(self.image_size),
            boot_size: upper.boot_size.or(self.boot_size),
            hostname: upper.hostname.or(self.hostname),
            output_dir: upper.output_dir.or(self.output_dir),
            workdir: upper.workdir.or(self.workdir),
            keep: upper.keep.or(self.keep),
            verbose: upper.verbose.or(self.verbose),
            timezone: upper.timezone.or(self.timezone),
            locale: upper.locale.or(self.locale),
            keymap: upper.keymap.or(self.keymap),
            packages: upper.packages.or(self.packages),
            ssh_key_urls: upper.ssh_key_urls.or(self.ssh_key_urls),
            ssh_port: upper.ssh_port.or(self.ssh_port),
            wifi_ssid: upper.wifi_ssid.or(self.wifi_ssid),
            wifi_password: upper.wifi_password.or(self.wifi_password),
            wifi_country: upper.wifi_country.or(self.wifi_country),
            zerotier_network: upper.zerotier_network.or(self.zerotier_network),
            usb_console: upper.usb_console.or(self.usb_console),
            base_url: upper.base_url.or(self.base_url),
            digest_url: upper.digest_url.or(self.digest_url),
            qemu_static: upper.qemu_static.or(self.qemu_static),
            fetch_retries: upper.fetch_retries.or(self.fetch_retries),
            fetch_timeout: upper.fetch_timeout.or(self.fetch_timeout),
        }
    }

    /// Load a TOML configuration file.
    pub fn from_file(path: &Path) -> Result<ConfigLayer> {
        let text = fs::read_to_string(path).map_err(|e| {
            BuildError::validation(
                "config",
                format!("reading '{}': {}", path.display(), e),
            )
        })?;
        toml::from_str(&text).map_err(|e| {
            BuildError::validation(
                "config",
                format!("parsing '{}': {}", path.display(), e),
            )
        })
    }

    /// Collect the `RPI_*` overrides from an environment map.
    ///
    /// Empty values count as unset so `RPI_WIFI_SSID=` in a wrapper script
    /// does not turn into an empty SSID.
    pub fn from_env(env: &HashMap<String, String>) -> Result<ConfigLayer> {
        let get = |key: &str| {
            env.get(key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        Ok(ConfigLayer {
            model: parse_opt(get("RPI_MODEL"), "model")?,
            image_size: parse_opt(get("RPI_IMAGE_SIZE"), "image_size")?,
            boot_size: parse_opt(get("RPI_BOOT_SIZE"), "boot_size")?,
            hostname: get("RPI_HOSTNAME"),
            output_dir: get("RPI_OUTPUT_DIR").map(PathBuf::from),
            workdir: get("RPI_WORKDIR").map(PathBuf::from),
            keep: parse_bool_opt(get("RPI_KEEP"), "keep")?,
            verbose: parse_bool_opt(get("RPI_VERBOSE"), "verbose")?,
            timezone: get("RPI_TIMEZONE"),
            locale: get("RPI_LOCALE"),
            keymap: get("RPI_KEYMAP"),
            packages: get("RPI_PACKAGES").map(|v| split_list(&v)),
            ssh_key_urls: get("RPI_SSH_KEY_URLS").map(|v| split_list(&v)),
            ssh_port: parse_opt(get("RPI_SSH_PORT"), "ssh_port")?,
            wifi_ssid: get("RPI_WIFI_SSID"),
            wifi_password: get("RPI_WIFI_PASSWORD"),
            wifi_country: get("RPI_WIFI_COUNTRY"),
            zerotier_network: get("RPI_ZEROTIER_NETWORK"),
            usb_console: parse_bool_opt(get("RPI_USB_CONSOLE"), "usb_console")?,
            base_url: get("RPI_BASE_URL"),
            digest_url: get("RPI_DIGEST_URL"),
            qemu_static: get("RPI_QEMU_STATIC").map(PathBuf::from),
            fetch_retries: parse_opt(get("RPI_FETCH_RETRIES"), "fetch_retries")?,
            fetch_timeout: parse_opt(get("RPI_FETCH_TIMEOUT"), "fetch_timeout")?,
        })
    }
}

/// Split a comma- or whitespace-separated list.
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

pub(crate) fn parse_value<T>(value: &str, field: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse::<T>()
        .map_err(|e| BuildError::validation(field, format!("'{}': {}", value, e)))
}

fn parse_opt<T>(value: Option<String>, field: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.map(|v| parse_value(&v, field)).transpose()
}

pub(crate) fn parse_bool(value: &str, field: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(BuildError::validation(
            field,
            format!("'{}' is not a boolean (use 1/0, true/false, yes/no)", other),
        )),
    }
}

fn parse_bool_opt(value: Option<String>, field: &str) -> Result<Option<bool>> {
    value.map(|v| parse_bool(&v, field)).transpose()
}
