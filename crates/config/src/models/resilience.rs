use std::collections::HashMap;
use std::time::Duration;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::validation::ConfigValidator;
use serde::{Deserialize, Serialize};

pub const AI_ENDPOINT_SERVICE: &str = "ai.endpoint";
pub const DURABLE_STORAGE_SERVICE: &str = "storage.durable";

/// Breaker settings: a default plus per-service overrides keyed by the
/// logical service name used with the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub default_breaker: CircuitBreakerConfig,
    pub services: HashMap<String, CircuitBreakerConfig>,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        let mut services = HashMap::new();
        services.insert(
            AI_ENDPOINT_SERVICE.to_string(),
            CircuitBreakerConfig {
                failure_threshold: 3,
                success_threshold: 2,
                reset_timeout: Duration::from_secs(30),
                call_timeout: Duration::from_secs(60),
                max_retries: 3,
                retry_delay: Duration::from_secs(1),
                recovery_backoff_multiplier: 2.0,
                max_reset_timeout: Duration::from_secs(240),
            },
        );
        services.insert(
            DURABLE_STORAGE_SERVICE.to_string(),
            CircuitBreakerConfig {
                failure_threshold: 5,
                success_threshold: 2,
                reset_timeout: Duration::from_secs(60),
                call_timeout: Duration::from_secs(5),
                max_retries: 1,
                retry_delay: Duration::from_millis(100),
                recovery_backoff_multiplier: 1.0,
                max_reset_timeout: Duration::from_secs(300),
            },
        );
        Self {
            default_breaker: CircuitBreakerConfig::default(),
            services,
        }
    }
}

impl ResilienceConfig {
    pub fn for_service(&self, service: &str) -> CircuitBreakerConfig {
        self.services
            .get(service)
            .cloned()
            .unwrap_or_else(|| self.default_breaker.clone())
    }
}

impl ConfigValidator for ResilienceConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        self.default_breaker.validate()?;
        for (name, breaker) in &self.services {
            breaker.validate().map_err(|e| {
                crate::ConfigError::Validation(format!("circuit_breaker.services.{name}: {e}"))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resilience_config_default() {
        let config = ResilienceConfig::default();

        assert_eq!(config.default_breaker.failure_threshold, 5);
        assert_eq!(config.for_service(AI_ENDPOINT_SERVICE).failure_threshold, 3);
        assert_eq!(
            config.for_service(DURABLE_STORAGE_SERVICE).call_timeout,
            Duration::from_secs(5)
        );
        // unknown services fall back to the default breaker
        assert_eq!(config.for_service("billing").failure_threshold, 5);
    }

    #[test]
    fn test_resilience_config_validation() {
        let config = ResilienceConfig::default();
        assert!(config.validate().is_ok());

        let mut invalid_config = config.clone();
        invalid_config
            .services
            .get_mut(AI_ENDPOINT_SERVICE)
            .unwrap()
            .failure_threshold = 0;
        let err = invalid_config.validate().unwrap_err();
        assert!(err.to_string().contains("ai.endpoint"));
    }

    #[test]
    fn test_resilience_config_serialization() {
        let config = ResilienceConfig::default();

        let serialized = serde_json::to_string(&config).expect("Failed to serialize");
        let deserialized: ResilienceConfig =
            serde_json::from_str(&serialized).expect("Failed to deserialize");

        assert_eq!(
            config.default_breaker.failure_threshold,
            deserialized.default_breaker.failure_threshold
        );
        assert_eq!(deserialized.services.len(), 2);
    }
}
