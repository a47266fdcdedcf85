use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration_serde::{millis, option_millis};
use crate::validation::{ConfigValidator, ValidationUtils};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Set to false to run on the session backend only
    pub durable_enabled: bool,
    /// SQLite URL or path of the durable store
    pub database_url: String,
    pub max_connections: u32,
    /// Payloads larger than this are compressed before persisting
    pub compression_threshold_bytes: usize,
    /// flate2 level, 0-9
    pub compression_level: u32,
    pub memory_cache_max_entries: usize,
    #[serde(with = "millis")]
    pub sweep_interval: Duration,
    #[serde(with = "millis")]
    pub memory_prune_interval: Duration,
    #[serde(with = "option_millis", skip_serializing_if = "Option::is_none")]
    pub default_cache_ttl: Option<Duration>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            durable_enabled: true,
            database_url: "sqlite://data/draftwork.db".to_string(),
            max_connections: 5,
            compression_threshold_bytes: 10 * 1024,
            compression_level: 6,
            memory_cache_max_entries: 500,
            sweep_interval: Duration::from_secs(300),       // 5 minutes
            memory_prune_interval: Duration::from_secs(60), // 1 minute
            default_cache_ttl: None,
        }
    }
}

impl ConfigValidator for StorageConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        if self.durable_enabled {
            ValidationUtils::validate_not_empty(&self.database_url, "storage.database_url")?;
            ValidationUtils::validate_count(
                self.max_connections as usize,
                "storage.max_connections",
            )?;
        }
        if self.compression_level > 9 {
            return Err(crate::ConfigError::Validation(
                "storage.compression_level must be between 0 and 9".to_string(),
            ));
        }
        ValidationUtils::validate_count(
            self.memory_cache_max_entries,
            "storage.memory_cache_max_entries",
        )?;
        ValidationUtils::validate_non_zero_duration(self.sweep_interval, "storage.sweep_interval")?;
        ValidationUtils::validate_non_zero_duration(
            self.memory_prune_interval,
            "storage.memory_prune_interval",
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_config_default() {
        let config = StorageConfig::default();
        assert!(config.durable_enabled);
        assert_eq!(config.compression_threshold_bytes, 10240);
        assert_eq!(config.sweep_interval, Duration::from_secs(300));
        assert_eq!(config.memory_prune_interval, Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_storage_config_validation() {
        let mut config = StorageConfig::default();
        config.compression_level = 12;
        assert!(config.validate().is_err());

        let mut config = StorageConfig::default();
        config.database_url = String::new();
        assert!(config.validate().is_err());

        // the URL is irrelevant without a durable backend
        config.durable_enabled = false;
        assert!(config.validate().is_ok());
    }
}
