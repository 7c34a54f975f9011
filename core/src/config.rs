use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Tunables shared by every task of a group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Instructions executed before the task goes back to its mailbox.
    pub slice: usize,
    /// Young cells allocated before a minor collection runs.
    pub minor_gc_threshold: usize,
    /// Number of minor collections between two major ones.
    pub major_every: u32,
    pub fish_hops: u32,
    pub fish_count: u32,
    pub idle_timeout_ms: u64,
    pub fish_interval_ms: u64,
    /// Period between distributed collection epochs; 0 disables them.
    pub dist_gc_interval_ms: u64,
    /// Nesting depth after which serialized values are sent as handles.
    pub max_serialize_depth: usize,
    pub seed: Option<u64>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            slice: 1024,
            minor_gc_threshold: 65_536,
            major_every: 8,
            fish_hops: 2,
            fish_count: 2,
            idle_timeout_ms: 10,
            fish_interval_ms: 20,
            dist_gc_interval_ms: 500,
            max_serialize_depth: 64,
            seed: None,
        }
    }
}

impl RuntimeConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).context("invalid runtime configuration")
    }

    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_toml_str(&text)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms.max(1))
    }

    pub fn fish_interval(&self) -> Duration {
        Duration::from_millis(self.fish_interval_ms)
    }

    pub fn dist_gc_interval(&self) -> Option<Duration> {
        (self.dist_gc_interval_ms > 0).then(|| Duration::from_millis(self.dist_gc_interval_ms))
    }
}
