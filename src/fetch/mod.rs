//! Downloads: base archive, its digest, and SSH key sources.
//!
//! Network transfer is the one operation in a build that is retried; every
//! other failure is final.

pub mod digest;

use anyhow::Context;
use log::{info, warn};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::thread;

use crate::config::{BuildConfig, FetchPolicy};
use crate::error::{BuildError, Result};

/// Transfer contract used by the orchestrator and the SSH stage.
pub trait Fetcher {
    /// Download `url` into `dest`, replacing it.
    fn fetch(&self, url: &str, dest: &Path) -> Result<()>;

    /// Download `url` as UTF-8 text.
    fn fetch_text(&self, url: &str) -> Result<String>;
}

/// HTTP(S) and `file://` fetcher with bounded retries.
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
    policy: FetchPolicy,
}

impl HttpFetcher {
    pub fn new(policy: FetchPolicy) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(policy.timeout)
            .user_agent(concat!("rpi-image-builder/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| BuildError::Download {
                url: String::new(),
                source: e.into(),
            })?;
        Ok(Self { client, policy })
    }

    fn with_retries<T>(
        &self,
        url: &str,
        mut attempt: impl FnMut() -> anyhow::Result<T>,
    ) -> Result<T> {
        let mut last_err = None;
        for n in 1..=self.policy.attempts {
            match attempt() {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!(
                        "download of {} failed (attempt {}/{}): {:#}",
                        url, n, self.policy.attempts, e
                    );
                    last_err = Some(e);
                    if n < self.policy.attempts {
                        thread::sleep(self.policy.retry_delay * n);
                    }
                }
            }
        }
        Err(BuildError::Download {
            url: url.to_string(),
            source: last_err.unwrap_or_else(|| anyhow::anyhow!("no attempts made")),
        })
    }

    fn download_once(&self, url: &str, dest: &Path) -> anyhow::Result<()> {
        let partial = partial_path(dest);
        if let Some(local) = url.strip_prefix("file://") {
            fs::copy(local, &partial).with_context(|| format!("copying {}", local))?;
        } else {
            let mut response = self
                .client
                .get(url)
                .send()
                .and_then(|r| r.error_for_status())
                .with_context(|| format!("requesting {}", url))?;
            let mut file = File::create(&partial)
                .with_context(|| format!("creating {}", partial.display()))?;
            response
                .copy_to(&mut file)
                .with_context(|| format!("receiving {}", url))?;
        }
        fs::rename(&partial, dest)
            .with_context(|| format!("moving download into {}", dest.display()))?;
        Ok(())
    }

    fn text_once(&self, url: &str) -> anyhow::Result<String> {
        if let Some(local) = url.strip_prefix("file://") {
            return fs::read_to_string(local).with_context(|| format!("reading {}", local));
        }
        let response = self
            .client
            .get(url)
            .send()
            .and_then(|r| r.error_for_status())
            .with_context(|| format!("requesting {}", url))?;
        let text = response.text().context("decoding response body")?;
        Ok(text)
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, url: &str, dest: &Path) -> Result<()> {
        info!("downloading {}", url);
        self.with_retries(url, || self.download_once(url, dest))
    }

    fn fetch_text(&self, url: &str) -> Result<String> {
        self.with_retries(url, || self.text_once(url))
    }
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    dest.with_file_name(name)
}

/// Last path segment of a URL, used as the local file name.
pub fn url_file_name(url: &str) -> &str {
    url.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or("download")
}

/// Download the base archive and its digest and verify one against the
/// other. Returns the archive path. Nothing on the block layer exists yet
/// when this runs, so a mismatch leaves no device state behind.
pub fn fetch_base_archive(
    fetcher: &dyn Fetcher,
    config: &BuildConfig,
    downloads: &Path,
) -> Result<PathBuf> {
    let archive_name = url_file_name(&config.base_url);
    let archive = downloads.join(archive_name);
    let digest_path = downloads.join(url_file_name(&config.digest_url));

    fetcher.fetch(&config.digest_url, &digest_path)?;
    let digest_text = fs::read_to_string(&digest_path).map_err(|e| BuildError::Download {
        url: config.digest_url.clone(),
        source: e.into(),
    })?;
    let expected =
        digest::parse_digest_file(&digest_text, archive_name).map_err(|e| BuildError::Download {
            url: config.digest_url.clone(),
            source: e,
        })?;

    fetcher.fetch(&config.base_url, &archive)?;
    digest::verify_file(&archive, &expected)?;
    Ok(archive)
}

/// Fetch every SSH key source and concatenate the keys.
///
/// A source that fails is skipped with a warning. An empty result is
/// returned as-is; the caller warns that key authentication will not work.
pub fn fetch_authorized_keys(fetcher: &dyn Fetcher, urls: &[String]) -> String {
    let mut keys = String::new();
    for url in urls {
        match fetcher.fetch_text(url) {
            Ok(text) => {
                let mut count = 0;
                for line in text.lines().map(str::trim) {
                    if line.is_empty() || line.starts_with('#') {
                        continue;
                    }
                    keys.push_str(line);
                    keys.push('\n');
                    count += 1;
                }
                info!("fetched {} SSH key(s) from {}", count, url);
            }
            Err(e) => warn!("skipping SSH key source {}: {}", url, e),
        }
    }
    keys
}
