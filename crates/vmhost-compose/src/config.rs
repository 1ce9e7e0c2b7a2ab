//! Engine configuration, loaded from TOML.
//!
//! Every field has a default, so an empty file (or no file) is valid.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use vmhost_capacity::ComposeDefaults;

const GIB: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub compose: ComposeConfig,
    #[serde(default)]
    pub delete: DeleteConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Bound on each per-rack discovery call.
    #[serde(default = "default_rpc_timeout_secs")]
    pub call_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComposeConfig {
    #[serde(default = "default_rpc_timeout_secs")]
    pub call_timeout_secs: u64,
    #[serde(default = "default_cores")]
    pub default_cores: u64,
    #[serde(default = "default_memory_mib")]
    pub default_memory_mib: u64,
    #[serde(default = "default_disk_bytes")]
    pub default_disk_bytes: u64,
    #[serde(default = "default_interfaces")]
    pub default_interfaces: u32,
    /// Skip the commissioning hand-off for every compose.
    #[serde(default)]
    pub skip_commissioning: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteConfig {
    /// How long a plain delete waits before telling the caller to poll.
    #[serde(default = "default_delete_timeout_secs")]
    pub timeout_secs: u64,
    /// Wait multiplier for a delete that decomposes machines.
    #[serde(default = "default_decompose_multiplier")]
    pub decompose_multiplier: u32,
    /// Bound on each per-machine decompose call.
    #[serde(default = "default_rpc_timeout_secs")]
    pub decompose_call_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directives, used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
    #[serde(default)]
    pub json: bool,
}

fn default_rpc_timeout_secs() -> u64 {
    120
}

fn default_cores() -> u64 {
    1
}

fn default_memory_mib() -> u64 {
    1024
}

fn default_disk_bytes() -> u64 {
    8 * GIB
}

fn default_interfaces() -> u32 {
    1
}

fn default_delete_timeout_secs() -> u64 {
    60
}

fn default_decompose_multiplier() -> u32 {
    4
}

fn default_log_filter() -> String {
    "info,vmhost=debug".to_string()
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            call_timeout_secs: default_rpc_timeout_secs(),
        }
    }
}

impl Default for ComposeConfig {
    fn default() -> Self {
        Self {
            call_timeout_secs: default_rpc_timeout_secs(),
            default_cores: default_cores(),
            default_memory_mib: default_memory_mib(),
            default_disk_bytes: default_disk_bytes(),
            default_interfaces: default_interfaces(),
            skip_commissioning: false,
        }
    }
}

impl Default for DeleteConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_delete_timeout_secs(),
            decompose_multiplier: default_decompose_multiplier(),
            decompose_call_timeout_secs: default_rpc_timeout_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            json: false,
        }
    }
}

impl EngineConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: EngineConfig = toml::from_str(content)?;
        if config.delete.decompose_multiplier == 0 {
            anyhow::bail!("delete.decompose_multiplier must be at least 1");
        }
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Set the per-rack discovery call timeout.
    pub fn with_discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery.call_timeout_secs = timeout.as_secs();
        self
    }

    /// Set the compose call timeout.
    pub fn with_compose_timeout(mut self, timeout: Duration) -> Self {
        self.compose.call_timeout_secs = timeout.as_secs();
        self
    }

    /// Set the plain delete wait. Decompose waits are derived from it.
    pub fn with_delete_timeout(mut self, timeout: Duration) -> Self {
        self.delete.timeout_secs = timeout.as_secs();
        self
    }

    /// Set the per-machine decompose call timeout.
    pub fn with_decompose_call_timeout(mut self, timeout: Duration) -> Self {
        self.delete.decompose_call_timeout_secs = timeout.as_secs();
        self
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery.call_timeout_secs)
    }

    pub fn compose_timeout(&self) -> Duration {
        Duration::from_secs(self.compose.call_timeout_secs)
    }

    pub fn decompose_call_timeout(&self) -> Duration {
        Duration::from_secs(self.delete.decompose_call_timeout_secs)
    }

    /// How long `delete_pod` waits for completion before returning.
    pub fn delete_wait(&self, decompose: bool) -> Duration {
        let base = Duration::from_secs(self.delete.timeout_secs);
        if decompose {
            base * self.delete.decompose_multiplier.max(1)
        } else {
            base
        }
    }

    pub fn compose_defaults(&self) -> ComposeDefaults {
        ComposeDefaults {
            cores: self.compose.default_cores,
            memory: self.compose.default_memory_mib,
            disk_bytes: self.compose.default_disk_bytes,
            interfaces: self.compose.default_interfaces,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.discovery_timeout(), Duration::from_secs(120));
        assert_eq!(config.compose_defaults(), ComposeDefaults::default());
        assert_eq!(config.logging.filter, "info,vmhost=debug");
    }

    #[test]
    fn decompose_waits_four_times_longer() {
        let config = EngineConfig::default();
        assert_eq!(config.delete_wait(false), Duration::from_secs(60));
        assert_eq!(config.delete_wait(true), Duration::from_secs(240));
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            [compose]
            default_cores = 2
            skip_commissioning = true

            [delete]
            timeout_secs = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.compose.default_cores, 2);
        assert_eq!(config.compose.default_memory_mib, 1024);
        assert!(config.compose.skip_commissioning);
        assert_eq!(config.delete_wait(true), Duration::from_secs(20));
    }

    #[test]
    fn zero_multiplier_rejected() {
        let err = EngineConfig::from_toml_str("[delete]\ndecompose_multiplier = 0\n").unwrap_err();
        assert!(err.to_string().contains("decompose_multiplier"));
    }

    #[test]
    fn builder_overrides() {
        let config = EngineConfig::default()
            .with_discovery_timeout(Duration::from_secs(5))
            .with_delete_timeout(Duration::from_secs(2));
        assert_eq!(config.discovery_timeout(), Duration::from_secs(5));
        assert_eq!(config.delete_wait(true), Duration::from_secs(8));
    }

    #[test]
    fn from_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        let config = EngineConfig::default().with_compose_timeout(Duration::from_secs(30));
        std::fs::write(&path, config.to_toml_string().unwrap()).unwrap();

        assert_eq!(EngineConfig::from_file(&path).unwrap(), config);
    }
}
