//! Command-line flag parsing.

use std::path::PathBuf;

use super::layer::{parse_bool, parse_value, ConfigLayer};
use crate::error::{BuildError, Result};

/// Parsed command line: either a help request or a configuration layer.
#[derive(Debug, Default, PartialEq)]
pub struct CliArgs {
    pub help: bool,
    pub config_file: Option<PathBuf>,
    pub layer: ConfigLayer,
}

pub fn usage() -> &'static str {
    "Usage: rpi-image-builder [OPTIONS]\n\
     \n\
     Options:\n  \
       -m, --model <4|5>         Raspberry Pi model to build for\n  \
       -s, --size <SIZE>         Image size, e.g. 4G (default 4G)\n      \
           --boot-size <SIZE>    Boot partition size (default 512M)\n  \
       -n, --hostname <NAME>     Hostname of the image (default alarmpi)\n  \
       -o, --output <DIR>        Output directory (default ./output)\n  \
       -w, --workdir <DIR>       Keep the workspace under DIR instead of the temp dir\n  \
       -c, --config <FILE>       TOML file with build settings\n  \
       -k, --keep                Skip automatic cleanup (leave devices attached)\n  \
       -v, --verbose             Trace every host command\n  \
       -h, --help                Show this help\n\
     \n\
     Every setting can also be given through RPI_* environment variables\n\
     (RPI_MODEL, RPI_IMAGE_SIZE, RPI_TIMEZONE, RPI_LOCALE, RPI_KEYMAP,\n\
     RPI_SSH_KEY_URLS, RPI_SSH_PORT, RPI_WIFI_SSID, RPI_WIFI_PASSWORD,\n\
     RPI_ZEROTIER_NETWORK, RPI_PACKAGES, ...). Flags override the environment."
}

/// Parse the arguments after the program name.
pub fn parse_args(args: &[String]) -> Result<CliArgs> {
    let mut cli = CliArgs::default();
    let mut iter = args.iter();

    while let Some(raw) = iter.next() {
        let (flag, inline) = match raw.split_once('=') {
            Some((flag, value)) if raw.starts_with("--") => (flag, Some(value.to_string())),
            _ => (raw.as_str(), None),
        };

        let mut value = |name: &str| -> Result<String> {
            match inline.clone() {
                Some(v) => Ok(v),
                None => iter
                    .next()
                    .cloned()
                    .ok_or_else(|| BuildError::Usage(format!("{} requires a value", name))),
            }
        };

        match flag {
            "-h" | "--help" => cli.help = true,
            "-k" | "--keep" => cli.layer.keep = Some(true),
            "-v" | "--verbose" => cli.layer.verbose = Some(true),
            "-m" | "--model" => cli.layer.model = Some(parse_value(&value(flag)?, "model")?),
            "-s" | "--size" => {
                cli.layer.image_size = Some(parse_value(&value(flag)?, "image_size")?)
            }
            "--boot-size" => cli.layer.boot_size = Some(parse_value(&value(flag)?, "boot_size")?),
            "-n" | "--hostname" => cli.layer.hostname = Some(value(flag)?),
            "-o" | "--output" => cli.layer.output_dir = Some(PathBuf::from(value(flag)?)),
            "-w" | "--workdir" => cli.layer.workdir = Some(PathBuf::from(value(flag)?)),
            "-c" | "--config" => cli.config_file = Some(PathBuf::from(value(flag)?)),
            "--usb-console" => {
                cli.layer.usb_console = Some(parse_bool(&value(flag)?, "usb_console")?)
            }
            other if other.starts_with('-') => {
                return Err(BuildError::Usage(format!("unknown flag '{}'", other)));
            }
            other => {
                return Err(BuildError::Usage(format!(
                    "unexpected argument '{}'",
                    other
                )));
            }
        }
    }

    Ok(cli)
}
