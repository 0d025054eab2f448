//! Turning the released raw image into the build's output files.
//!
//! ```text
//! <output>/<hostname>-rpi<model>.img.zst
//! <output>/<hostname>-rpi<model>.root-password   (0600)
//! <output>/<hostname>-rpi<model>.manifest.json
//! ```
//!
//! The raw image is only read, never moved: if compression fails it is
//! still in the preserved workspace.

use anyhow::{Context, Result};
use log::info;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::config::{BuildConfig, TargetModel};
use crate::fetch::digest::sha256_file;
use crate::rootfs;
use crate::stages::StageRecord;

pub const COMPRESSION_LEVEL: i32 = 10;
const BUFFER_SIZE: usize = 1024 * 1024;

/// Paths of everything written to the output directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outputs {
    pub artifact: PathBuf,
    pub credential_file: PathBuf,
    pub manifest: PathBuf,
}

#[derive(Debug, Serialize)]
struct Manifest<'a> {
    hostname: &'a str,
    model: TargetModel,
    image_size_bytes: u64,
    boot_size_bytes: u64,
    artifact: &'a Path,
    artifact_sha256: String,
    artifact_size_bytes: u64,
    base_url: &'a str,
    started_at_utc: String,
    finished_at_utc: String,
    stages: &'a [StageRecord],
}

pub fn now_utc_rfc3339() -> Result<String> {
    Ok(OffsetDateTime::now_utc().format(&Rfc3339)?)
}

/// Stream `raw` through zstd into `dest`, via `dest.part`.
pub fn compress(raw: &Path, dest: &Path) -> Result<u64> {
    let partial = dest.with_extension("zst.part");
    let input = File::open(raw).with_context(|| format!("Failed to open {}", raw.display()))?;
    let output = File::create(&partial)
        .with_context(|| format!("Failed to create {}", partial.display()))?;

    let mut reader = BufReader::with_capacity(BUFFER_SIZE, input);
    let mut encoder = zstd::stream::Encoder::new(BufWriter::with_capacity(BUFFER_SIZE, output), COMPRESSION_LEVEL)?;
    let copied = io::copy(&mut reader, &mut encoder)
        .with_context(|| format!("compressing {}", raw.display()))?;
    let mut writer = encoder.finish()?;
    writer.flush()?;
    writer
        .into_inner()
        .map_err(|e| e.into_error())?
        .sync_all()?;

    fs::rename(&partial, dest).with_context(|| {
        format!("Failed to move {} to {}", partial.display(), dest.display())
    })?;
    Ok(copied)
}

/// Write the compressed image, the root credential and the manifest.
pub fn write_outputs(
    config: &BuildConfig,
    raw_image: &Path,
    root_password: &str,
    stages: &[StageRecord],
    started_at_utc: &str,
) -> Result<Outputs> {
    let out = &config.output_dir;
    fs::create_dir_all(out).with_context(|| format!("Failed to create {}", out.display()))?;
    let stem = config.artifact_stem();

    let artifact = out.join(format!("{}.img.zst", stem));
    println!("Compressing image to {}...", artifact.display());
    let raw_size = compress(raw_image, &artifact)?;
    let (sha256, size) = sha256_file(&artifact)?;
    info!(
        "{} bytes compressed to {} bytes ({})",
        raw_size,
        size,
        artifact.display()
    );

    let credential_name = format!("{}.root-password", stem);
    rootfs::write_file_mode(out, &credential_name, &format!("{}\n", root_password), 0o600)?;

    let manifest = Manifest {
        hostname: &config.hostname,
        model: config.model,
        image_size_bytes: config.image_size.as_bytes(),
        boot_size_bytes: config.boot_size.as_bytes(),
        artifact: &artifact,
        artifact_sha256: sha256,
        artifact_size_bytes: size,
        base_url: &config.base_url,
        started_at_utc: started_at_utc.to_string(),
        finished_at_utc: now_utc_rfc3339()?,
        stages,
    };
    let manifest_path = out.join(format!("{}.manifest.json", stem));
    let json = serde_json::to_string_pretty(&manifest)?;
    fs::write(&manifest_path, json + "\n")
        .with_context(|| format!("Failed to write {}", manifest_path.display()))?;

    Ok(Outputs {
        artifact,
        credential_file: out.join(credential_name),
        manifest: manifest_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::{StageOutcome, StageRecord};
    use std::io::Read;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    #[test]
    fn test_compress_round_trips() {
        let temp = TempDir::new().unwrap();
        let raw = temp.path().join("disk.img");
        let mut payload = vec![0u8; 3 * 1024 * 1024];
        payload[12345] = 7;
        fs::write(&raw, &payload).unwrap();

        let dest = temp.path().join("out.img.zst");
        assert_eq!(compress(&raw, &dest).unwrap(), payload.len() as u64);
        assert!(!temp.path().join("out.img.zst.part").exists());

        let mut decoded = Vec::new();
        zstd::stream::Decoder::new(File::open(&dest).unwrap())
            .unwrap()
            .read_to_end(&mut decoded)
            .unwrap();
        assert_eq!(decoded, payload);
        assert!(raw.exists());
    }

    #[test]
    fn test_outputs_and_credential_mode() {
        let temp = TempDir::new().unwrap();
        let raw = temp.path().join("disk.img");
        fs::write(&raw, b"raw image bytes").unwrap();

        let mut config = crate::stages::tests::config();
        config.output_dir = temp.path().join("output");
        config.hostname = "pi".into();
        let records = vec![StageRecord {
            ordinal: 1,
            name: "extract-base",
            outcome: StageOutcome::Ran,
        }];

        let outputs =
            write_outputs(&config, &raw, "pw", &records, "2026-01-01T00:00:00Z").unwrap();
        assert_eq!(outputs.artifact, temp.path().join("output/pi-rpi4.img.zst"));
        let cred = fs::metadata(&outputs.credential_file).unwrap();
        assert_eq!(cred.permissions().mode() & 0o777, 0o600);
        assert_eq!(fs::read_to_string(&outputs.credential_file).unwrap(), "pw\n");

        let manifest: serde_json::Value =
            serde_json::from_slice(&fs::read(&outputs.manifest).unwrap()).unwrap();
        assert_eq!(manifest["model"], "4");
        assert_eq!(manifest["hostname"], "pi");
        assert_eq!(manifest["stages"][0]["outcome"], "ran");
        assert_eq!(manifest["artifact_sha256"].as_str().unwrap().len(), 64);
    }

    #[test]
    fn test_missing_raw_image_fails() {
        let temp = TempDir::new().unwrap();
        assert!(compress(&temp.path().join("gone.img"), &temp.path().join("x.zst")).is_err());
    }
}
