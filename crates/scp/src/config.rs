//! Session options

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Options shared by every session started from this config
///
/// All fields have defaults, so a partial `[scp]` table is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScpConfig {
    /// Program started on the remote side
    pub program: String,
    /// Bound on every individual read, in milliseconds
    pub timeout_ms: u64,
    /// Pass `-p` and exchange `T` lines
    pub preserve_times: bool,
    /// Drop the root directory's own entry from recursive pulls
    pub skip_root: bool,
}

impl Default for ScpConfig {
    fn default() -> Self {
        Self {
            program: "scp".to_string(),
            timeout_ms: 30_000,
            preserve_times: true,
            skip_root: true,
        }
    }
}

impl ScpConfig {
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    #[must_use]
    pub fn with_skip_root(mut self, skip_root: bool) -> Self {
        self.skip_root = skip_root;
        self
    }
}
