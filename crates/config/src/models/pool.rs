use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration_serde::{millis, option_millis};
use crate::validation::{ConfigValidator, ValidationUtils};

/// Worker pool sizing and lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_document_workers: usize,
    pub max_text_workers: usize,
    /// Consecutive task failures before a worker is retired
    pub max_errors_per_worker: u32,
    /// Idle workers older than this are reaped by maintenance
    #[serde(with = "millis")]
    pub idle_timeout: Duration,
    #[serde(with = "millis")]
    pub maintenance_interval: Duration,
    /// Deadline applied to tasks submitted without one
    #[serde(with = "option_millis", skip_serializing_if = "Option::is_none")]
    pub default_task_timeout: Option<Duration>,
    /// Terminal statuses kept for `status()` lookups
    pub finished_history: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_document_workers: 2,
            max_text_workers: 4,
            max_errors_per_worker: 3,
            idle_timeout: Duration::from_secs(300),
            maintenance_interval: Duration::from_secs(30),
            default_task_timeout: None,
            finished_history: 1024,
        }
    }
}

impl ConfigValidator for PoolConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_count(self.max_document_workers, "pool.max_document_workers")?;
        ValidationUtils::validate_count(self.max_text_workers, "pool.max_text_workers")?;
        ValidationUtils::validate_count(
            self.max_errors_per_worker as usize,
            "pool.max_errors_per_worker",
        )?;
        ValidationUtils::validate_non_zero_duration(self.idle_timeout, "pool.idle_timeout")?;
        ValidationUtils::validate_non_zero_duration(
            self.maintenance_interval,
            "pool.maintenance_interval",
        )?;
        if let Some(timeout) = self.default_task_timeout {
            ValidationUtils::validate_non_zero_duration(timeout, "pool.default_task_timeout")?;
        }
        Ok(())
    }
}
