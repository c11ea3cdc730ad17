use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_ENDPOINT: &str = "https://trace.agent.datadoghq.com";
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8126";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub hostname: String,
    pub default_env: String,
    pub endpoint: String,
    pub api_key: String,
    /// Memory ceiling in bytes, 0 when unbound.
    pub max_memory: u64,
    pub listen_addr: String,
    pub stats_writer: StatsWriterConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            hostname: String::new(),
            default_env: "none".to_string(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key: String::new(),
            max_memory: 0,
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            stats_writer: StatsWriterConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsWriterConfig {
    /// Concurrent deliveries, 0 for the default.
    pub connection_limit: usize,
    /// Sender queue depth, 0 to derive it from `max_memory`.
    pub queue_size: usize,
    pub drain_timeout_secs: u64,
    pub max_attempts: u32,
}

impl Default for StatsWriterConfig {
    fn default() -> Self {
        Self {
            connection_limit: 0,
            queue_size: 0,
            drain_timeout_secs: 10,
            max_attempts: 4,
        }
    }
}

impl AgentConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read {}", path.as_ref().display()))?;
        let config: AgentConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.as_ref().display()))?;
        Ok(config)
    }
}
