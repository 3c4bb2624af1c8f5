//! Daemon configuration -- TOML file with CLI overrides on top.

use crate::scheduler::OverlapPolicy;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// API server bind address.
    pub bind: String,
    /// SQLite database path.
    pub db_path: String,
    /// Fixed per-request HTTP timeout for case execution.
    pub request_timeout_secs: u64,
    /// Wall-clock budget per assertion script evaluation.
    pub script_timeout_ms: u64,
    /// Operation budget per assertion script evaluation.
    pub script_max_ops: u64,
    /// Scheduler poll interval.
    pub poll_interval_secs: u64,
    /// Behavior when a cron tick fires while the task's previous run is
    /// still in flight.
    pub overlap_policy: OverlapPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
            db_path: "data/apipulse.db".to_string(),
            request_timeout_secs: 30,
            script_timeout_ms: 1_000,
            script_max_ops: 100_000,
            poll_interval_secs: 10,
            overlap_policy: OverlapPolicy::Allow,
        }
    }
}

impl Config {
    /// Load from a TOML file; a missing file yields the defaults.
    pub fn load(path: &str) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(raw) => {
                toml::from_str(&raw).with_context(|| format!("invalid config file {}", path))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("cannot read config file {}", path)),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn script_timeout(&self) -> Duration {
        Duration::from_millis(self.script_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}
