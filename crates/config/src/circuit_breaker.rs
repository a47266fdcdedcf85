use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration_serde::millis;
use crate::{ConfigError, ConfigResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: usize,
    /// Consecutive half-open successes that close it again
    pub success_threshold: usize,
    /// Time spent open before a probe is allowed
    #[serde(with = "millis")]
    pub reset_timeout: Duration,
    /// Upper bound for a whole call, retries included
    #[serde(with = "millis")]
    pub call_timeout: Duration,
    pub max_retries: u32,
    /// Base delay; retry i waits retry_delay * 2^i
    #[serde(with = "millis")]
    pub retry_delay: Duration,
    /// Growth of reset_timeout after each failed probe (1.0 keeps it fixed)
    pub recovery_backoff_multiplier: f64,
    #[serde(with = "millis")]
    pub max_reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(60),
            call_timeout: Duration::from_secs(10),
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            recovery_backoff_multiplier: 1.0,
            max_reset_timeout: Duration::from_secs(300), // 5 minutes
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::Validation(
                "failure_threshold must be greater than 0".to_string(),
            ));
        }

        if self.success_threshold == 0 {
            return Err(ConfigError::Validation(
                "success_threshold must be greater than 0".to_string(),
            ));
        }

        if self.recovery_backoff_multiplier < 1.0 {
            return Err(ConfigError::Validation(
                "recovery_backoff_multiplier must be at least 1.0".to_string(),
            ));
        }

        if self.reset_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "reset_timeout must be greater than 0".to_string(),
            ));
        }

        if self.call_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "call_timeout must be greater than 0".to_string(),
            ));
        }

        if self.reset_timeout > self.max_reset_timeout {
            return Err(ConfigError::Validation(
                "reset_timeout must be less than or equal to max_reset_timeout".to_string(),
            ));
        }

        Ok(())
    }

    /// Worst-case time spent sleeping between attempts.
    pub fn total_backoff(&self) -> Duration {
        (0..self.max_retries)
            .map(|i| self.retry_delay.saturating_mul(1u32 << i.min(31)))
            .fold(Duration::ZERO, |acc, d| acc.saturating_add(d))
    }
}
