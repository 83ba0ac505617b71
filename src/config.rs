//! Configuration for the disk agent core

use crate::error::{AgentError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Configuration of one block I/O adapter (immutable after construction)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageAdapterConfig {
    /// Physical block size of the underlying storage, in bytes (default: 4096)
    #[serde(default = "default_storage_block_size")]
    pub storage_block_size: u32,

    /// Reshape scatter-gather lists to storage block granularity (default: true)
    #[serde(default = "default_true")]
    pub normalize: bool,

    /// Maximum total bytes per request; 0 means unlimited (default: 0)
    #[serde(default)]
    pub max_request_size: u64,

    /// Fail requests older than this many milliseconds; 0 disables timeout
    /// tracking entirely (default: 0)
    #[serde(default)]
    pub max_request_duration_ms: u64,

    /// How long shutdown waits for inflight requests to drain (default: 10s)
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

/// Configuration of the device session store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceClientConfig {
    /// Writer sessions idle longer than this many milliseconds no longer
    /// block a takeover (default: 10s)
    #[serde(default = "default_release_timeout_ms")]
    pub release_inactive_sessions_timeout_ms: u64,

    /// Device UUIDs known to the agent, fixed for the process lifetime
    #[serde(default)]
    pub devices: Vec<String>,
}

/// Top-level agent core configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub adapter: StorageAdapterConfig,

    #[serde(default)]
    pub sessions: DeviceClientConfig,
}

fn default_storage_block_size() -> u32 {
    4096
}

fn default_true() -> bool {
    true
}

fn default_shutdown_timeout_ms() -> u64 {
    10_000
}

fn default_release_timeout_ms() -> u64 {
    10_000
}

impl Default for StorageAdapterConfig {
    fn default() -> Self {
        Self {
            storage_block_size: default_storage_block_size(),
            normalize: default_true(),
            max_request_size: 0,
            max_request_duration_ms: 0,
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

impl Default for DeviceClientConfig {
    fn default() -> Self {
        Self {
            release_inactive_sessions_timeout_ms: default_release_timeout_ms(),
            devices: Vec::new(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            adapter: StorageAdapterConfig::default(),
            sessions: DeviceClientConfig::default(),
        }
    }
}

impl StorageAdapterConfig {
    pub fn max_request_duration(&self) -> Duration {
        Duration::from_millis(self.max_request_duration_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.storage_block_size == 0 {
            return Err(AgentError::invalid_argument(
                "storage_block_size must be non-zero",
            ));
        }
        if !self.storage_block_size.is_power_of_two() {
            return Err(AgentError::invalid_argument(format!(
                "storage_block_size must be a power of two, got {}",
                self.storage_block_size
            )));
        }
        if self.max_request_size != 0 && self.max_request_size % self.storage_block_size as u64 != 0
        {
            return Err(AgentError::invalid_argument(format!(
                "max_request_size ({}) must be a multiple of storage_block_size ({})",
                self.max_request_size, self.storage_block_size
            )));
        }
        Ok(())
    }
}

impl DeviceClientConfig {
    pub fn release_inactive_sessions_timeout(&self) -> Duration {
        Duration::from_millis(self.release_inactive_sessions_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.release_inactive_sessions_timeout_ms == 0 {
            return Err(AgentError::invalid_argument(
                "release_inactive_sessions_timeout_ms must be non-zero",
            ));
        }
        if self.devices.is_empty() {
            return Err(AgentError::invalid_argument(
                "at least one device uuid must be configured",
            ));
        }
        Ok(())
    }
}

impl AgentConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            AgentError::invalid_argument(format!(
                "failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;

        let config: AgentConfig = serde_yaml::from_str(&content)
            .map_err(|e| AgentError::invalid_argument(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.adapter.validate()?;
        self.sessions.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_adapter_is_valid() {
        let config = StorageAdapterConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.storage_block_size, 4096);
        assert!(config.normalize);
        assert!(config.max_request_duration().is_zero());
    }

    #[test]
    fn test_rejects_non_power_of_two_block_size() {
        let config = StorageAdapterConfig {
            storage_block_size: 4000,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_unaligned_max_request_size() {
        let config = StorageAdapterConfig {
            max_request_size: 4096 * 10 + 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_session_config_requires_devices() {
        let config = DeviceClientConfig::default();
        assert!(config.validate().is_err());

        let config = DeviceClientConfig {
            devices: vec!["uuid-1".to_string()],
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
adapter:
  storage_block_size: 512
  normalize: false
  max_request_size: 1048576
  max_request_duration_ms: 30000
sessions:
  release_inactive_sessions_timeout_ms: 5000
  devices:
    - "uuid-1"
    - "uuid-2"
"#;
        let config: AgentConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.adapter.storage_block_size, 512);
        assert!(!config.adapter.normalize);
        assert_eq!(
            config.adapter.max_request_duration(),
            Duration::from_secs(30)
        );
        assert_eq!(config.sessions.devices.len(), 2);
    }
}
