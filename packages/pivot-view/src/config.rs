use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Engine-wide settings.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Size of the notify worker pool; `None` lets rayon pick.
    pub worker_threads: Option<usize>,
    /// Minimum number of registered views before notify fans out in parallel.
    pub parallel_threshold: usize,
    /// Default `tracing` filter when `RUST_LOG` is not set.
    pub log_filter: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_threads: None,
            parallel_threshold: 2,
            log_filter: "info".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load from a YAML file. Missing keys take their defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .context(format!("Failed to read engine config: {:?}", path))?;
        Self::from_yaml_str(&raw).context(format!("Failed to parse engine config: {:?}", path))
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: EngineConfig = serde_yaml::from_str(raw).context("Invalid engine config")?;
        if config.worker_threads == Some(0) {
            anyhow::bail!("worker_threads must be at least 1");
        }
        Ok(config)
    }
}
