use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ScanError};

/// Engine-wide settings. Every field has a default, so a config file only
/// needs the keys it wants to change.
///
/// ```toml
/// nmap_path = "/usr/local/bin/nmap"
/// default_concurrency = 64
/// grace_period_ms = 3000
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// External scanner executable, resolved through `PATH` when relative.
    pub nmap_path: PathBuf,
    /// Directory for temporary scanner reports. System temp dir when unset.
    pub work_dir: Option<PathBuf>,
    /// Terminal jobs retained for status queries.
    pub history_limit: usize,
    /// How long a terminated scanner subprocess may take to exit before it is killed.
    pub grace_period_ms: u64,
    pub default_concurrency: usize,
    pub stealth_concurrency: usize,
    pub default_timeout_ms: u64,
    /// Lower bound on the per-probe timeout under the stealth profile.
    pub stealth_timeout_ms: u64,
    pub default_retries: u32,
    /// Concurrent TCP connects across all hosts during the port pass.
    pub port_concurrency: usize,
    /// Largest address set a single target specification may expand to.
    pub max_targets: usize,
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            nmap_path: PathBuf::from("nmap"),
            work_dir: None,
            history_limit: 32,
            grace_period_ms: 5_000,
            default_concurrency: 32,
            stealth_concurrency: 5,
            default_timeout_ms: 1_000,
            stealth_timeout_ms: 3_000,
            default_retries: 1,
            port_concurrency: 256,
            max_targets: 65_536,
            event_capacity: 4_096,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| ScanError::Config(e.to_string()))
    }

    /// Load from a TOML file. Errors if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ScanError::Config(format!("failed to read {}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn work_dir(&self) -> PathBuf {
        self.work_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}
