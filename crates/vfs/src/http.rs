//! HTTP backend (read-only)
//!
//! Fetches files with GET and answers stat with HEAD. Paths are either full
//! `http(s)://` URLs or are joined onto a base URL.

use std::time::{Duration, SystemTime};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::DateTime;
use reqwest::header::{HeaderMap, CONTENT_LENGTH, LAST_MODIFIED};

use super::{FileStat, VfsBackend};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Read-only access to files served over HTTP/HTTPS
pub struct HttpFs {
    client: reqwest::Client,
    /// Base URL (optional, for relative paths)
    base_url: Option<String>,
}

impl HttpFs {
    pub fn new() -> Self {
        Self {
            client: build_client(),
            base_url: None,
        }
    }

    /// Create with a base URL for relative paths
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            client: build_client(),
            base_url: Some(base_url.into()),
        }
    }

    fn resolve_url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else if let Some(base) = &self.base_url {
            format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
        } else {
            format!("https://{}", path.trim_start_matches('/'))
        }
    }
}

impl Default for HttpFs {
    fn default() -> Self {
        Self::new()
    }
}

fn build_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .unwrap_or_default()
}

/// Parse an HTTP date such as `Wed, 21 Oct 2015 07:28:00 GMT`
fn parse_http_date(value: &str) -> Option<SystemTime> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(SystemTime::from)
}

fn stat_from_headers(headers: &HeaderMap) -> FileStat {
    let size = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    let modified = headers
        .get(LAST_MODIFIED)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_http_date);

    FileStat::file(size).with_modified(modified).read_only()
}

#[async_trait]
impl VfsBackend for HttpFs {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let url = self.resolve_url(path);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| anyhow!("HTTP request failed: {e}"))?;

        if !response.status().is_success() {
            bail!("HTTP {} for {}", response.status(), url);
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| anyhow!("Failed to read response: {e}"))?;
        tracing::debug!(%url, size = bytes.len(), "fetched");

        Ok(bytes.to_vec())
    }

    async fn write(&self, _path: &str, _data: &[u8]) -> Result<()> {
        bail!("HTTP backend is read-only")
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        let url = self.resolve_url(path);

        let response = self
            .client
            .head(&url)
            .send()
            .await
            .map_err(|e| anyhow!("HTTP HEAD failed: {e}"))?;

        if !response.status().is_success() {
            bail!("HTTP {} for {}", response.status(), url);
        }

        Ok(stat_from_headers(response.headers()))
    }

    async fn list(&self, _path: &str) -> Result<Vec<String>> {
        bail!("HTTP backend does not support directory listing")
    }
}
