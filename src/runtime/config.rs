use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// 编排器配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Upper bound for every storage call.
    pub storage_timeout_ms: u64,
    /// Key namespace used by the Redis state manager.
    pub key_prefix: String,
    /// Deepest call chain a flow may build before it is rejected.
    pub max_chain_depth: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            storage_timeout_ms: 5_000,
            key_prefix: "resumable".to_string(),
            max_chain_depth: 1024,
        }
    }
}

impl OrchestratorConfig {
    pub fn storage_timeout(&self) -> Duration {
        Duration::from_millis(self.storage_timeout_ms)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        serde_yaml::from_str(raw).context("invalid orchestrator config")
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_yaml_str(&raw)
    }
}
