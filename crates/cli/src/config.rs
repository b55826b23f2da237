//! Configuration for the `omnistore` binary
//!
//! Reads config from ~/.config/omnistore/config.toml

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use omnistore_scp::ScpConfig;
use serde::{Deserialize, Serialize};

const DEFAULT_CONFIG: &str = r#"# omnistore configuration

[remote]
# argv prefix used to reach the remote host; empty runs scp locally
# via = ["ssh", "-p", "22", "user@example.com"]
via = []
# remote directory that relative paths hang off
root = ""

[scp]
program = "scp"
timeout_ms = 30000
preserve_times = true
skip_root = true
"#;

/// How the remote host is reached
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub via: Vec<String>,
    pub root: String,
}

/// Full application configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub remote: RemoteConfig,
    pub scp: ScpConfig,
}

impl Config {
    /// Load from the default path, falling back to defaults
    pub fn load() -> Self {
        let path = Self::default_config_path();
        if !path.exists() {
            return Self::default();
        }
        match Self::load_from_path(&path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring config");
                Self::default()
            }
        }
    }

    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("omnistore")
            .join("config.toml")
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content =
            fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    /// Write the commented default config if nothing is there yet
    ///
    /// Returns whether a file was written.
    pub fn create_default_if_missing(path: &Path) -> Result<bool> {
        if path.exists() {
            return Ok(false);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, DEFAULT_CONFIG)
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(true)
    }
}
