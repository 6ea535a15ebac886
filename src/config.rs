//! Sync configuration
//!
//! Passed explicitly to the inserters and the downloader at construction.
//! Every field has a default, so a config file only needs to name what it
//! changes.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub inserter: InserterConfig,
    #[serde(default)]
    pub downloader: DownloaderConfig,
}

impl SyncConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }
}

/// Publishing behaviour of each local document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InserterConfig {
    /// Quiet period after the last local edit before a publish starts.
    #[serde(default = "default_debounce_secs")]
    pub debounce_secs: u64,

    /// How often each inserter checks its document.
    #[serde(default = "default_tick_millis")]
    pub tick_millis: u64,

    /// First delay after a failed publish; doubles per failure.
    #[serde(default = "default_retry_initial_millis")]
    pub retry_initial_millis: u64,

    #[serde(default = "default_retry_max_millis")]
    pub retry_max_millis: u64,
}

impl Default for InserterConfig {
    fn default() -> Self {
        Self {
            debounce_secs: default_debounce_secs(),
            tick_millis: default_tick_millis(),
            retry_initial_millis: default_retry_initial_millis(),
            retry_max_millis: default_retry_max_millis(),
        }
    }
}

impl InserterConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_secs(self.debounce_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_millis.max(1))
    }

    pub fn retry_initial(&self) -> Duration {
        Duration::from_millis(self.retry_initial_millis)
    }

    /// Never shorter than the initial delay.
    pub fn retry_max(&self) -> Duration {
        Duration::from_millis(self.retry_max_millis.max(self.retry_initial_millis))
    }
}

fn default_debounce_secs() -> u64 {
    60
}

fn default_tick_millis() -> u64 {
    1000
}

fn default_retry_initial_millis() -> u64 {
    1000
}

fn default_retry_max_millis() -> u64 {
    300_000
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloaderConfig {
    /// Manifest entry holding the structured document.
    #[serde(default = "default_resource_name")]
    pub resource_name: String,

    #[serde(default = "default_max_concurrent_fetches")]
    pub max_concurrent_fetches: usize,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            resource_name: default_resource_name(),
            max_concurrent_fetches: default_max_concurrent_fetches(),
        }
    }
}

fn default_resource_name() -> String {
    crate::sync::wire::DEFAULT_RESOURCE_NAME.to_string()
}

fn default_max_concurrent_fetches() -> usize {
    4
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.inserter.debounce(), Duration::from_secs(60));
        assert_eq!(config.inserter.tick_interval(), Duration::from_secs(1));
        assert_eq!(config.inserter.retry_max(), Duration::from_secs(300));
        assert_eq!(config.downloader.resource_name, "sone.json");
        assert_eq!(config.downloader.max_concurrent_fetches, 4);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config =
            SyncConfig::from_json_str(r#"{ "inserter": { "debounce_secs": 5 } }"#).unwrap();
        assert_eq!(config.inserter.debounce_secs, 5);
        assert_eq!(config.inserter.tick_millis, 1000);
        assert_eq!(config.downloader, DownloaderConfig::default());

        assert_eq!(SyncConfig::from_json_str("{}").unwrap(), SyncConfig::default());
    }

    #[test]
    fn test_retry_max_not_below_initial() {
        let config = InserterConfig {
            retry_initial_millis: 5000,
            retry_max_millis: 10,
            ..Default::default()
        };
        assert_eq!(config.retry_max(), Duration::from_secs(5));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "downloader": {{ "resource_name": "doc.json" }} }}"#).unwrap();
        let config = SyncConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.downloader.resource_name, "doc.json");
    }

    #[test]
    fn test_errors() {
        assert!(matches!(
            SyncConfig::from_json_str("{ nope"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            SyncConfig::from_json_file("/definitely/not/here.json"),
            Err(ConfigError::Io(_))
        ));
    }
}
