use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use draftwork_config::{CircuitBreakerConfig, ResilienceConfig};
use draftwork_errors::RuntimeResult;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::circuit_breaker::{
    CallContext, CircuitBreaker, CircuitBreakerListener, CircuitBreakerStats,
};

/// One breaker per logical service name, created on first use.
pub struct CircuitBreakerRegistry {
    config: ResilienceConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    listeners: Vec<Arc<dyn CircuitBreakerListener>>,
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(ResilienceConfig::default())
    }
}

impl CircuitBreakerRegistry {
    pub fn new(config: ResilienceConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
            listeners: Vec::new(),
        }
    }

    /// Listener attached to every breaker created afterwards.
    pub fn with_listener(mut self, listener: Arc<dyn CircuitBreakerListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub async fn get(&self, service: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().await.get(service).cloned()
    }

    pub async fn get_or_create(&self, service: &str) -> Arc<CircuitBreaker> {
        self.get_or_create_with(service, None).await
    }

    /// `config` only applies when the breaker does not exist yet.
    pub async fn get_or_create_with(
        &self,
        service: &str,
        config: Option<CircuitBreakerConfig>,
    ) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.get(service).await {
            return existing;
        }

        let mut breakers = self.breakers.write().await;
        breakers
            .entry(service.to_string())
            .or_insert_with(|| {
                let config = config.unwrap_or_else(|| self.config.for_service(service));
                debug!("Creating circuit breaker {} with {:?}", service, config);
                Arc::new(CircuitBreaker::new(service, config).with_listeners(&self.listeners))
            })
            .clone()
    }

    pub async fn stats(&self) -> Vec<CircuitBreakerStats> {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.read().await.values().cloned().collect();
        let mut stats = Vec::with_capacity(breakers.len());
        for breaker in breakers {
            stats.push(breaker.stats().await);
        }
        stats.sort_by(|a, b| a.service.cmp(&b.service));
        stats
    }

    pub async fn reset(&self, service: &str) -> bool {
        match self.get(service).await {
            Some(breaker) => {
                breaker.reset().await;
                true
            }
            None => false,
        }
    }

    pub async fn reset_all(&self) {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.read().await.values().cloned().collect();
        for breaker in &breakers {
            breaker.reset().await;
        }
        info!("Reset {} circuit breakers", breakers.len());
    }
}

/// Per-call options for [`with_circuit_breaker`].
#[derive(Debug, Clone, Default)]
pub struct CircuitCallOptions {
    /// Used if this call creates the service's breaker
    pub config: Option<CircuitBreakerConfig>,
}

pub async fn with_circuit_breaker<F, Fut, T>(
    registry: &CircuitBreakerRegistry,
    operation: F,
    service: &str,
    context: CallContext,
    options: CircuitCallOptions,
) -> RuntimeResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = RuntimeResult<T>>,
{
    let breaker = registry.get_or_create_with(service, options.config).await;
    breaker.execute(operation, context).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use draftwork_config::models::AI_ENDPOINT_SERVICE;
    use draftwork_config::CircuitState;
    use draftwork_errors::RuntimeError;
    use std::time::Duration;

    #[tokio::test]
    async fn test_registry_creates_once_per_service() {
        let registry = CircuitBreakerRegistry::default();
        let a = registry.get_or_create("ocr").await;
        let b = registry.get_or_create("ocr").await;
        assert!(Arc::ptr_eq(&a, &b));
        assert!(registry.get("other").await.is_none());
    }

    #[tokio::test]
    async fn test_registry_uses_service_overrides() {
        let registry = CircuitBreakerRegistry::default();
        let ai = registry.get_or_create(AI_ENDPOINT_SERVICE).await;
        assert_eq!(ai.config().failure_threshold, 3);
        let other = registry.get_or_create("unknown").await;
        assert_eq!(other.config().failure_threshold, 5);
    }

    #[tokio::test]
    async fn test_with_circuit_breaker_and_reset() {
        let registry = CircuitBreakerRegistry::default();
        let options = CircuitCallOptions {
            config: Some(CircuitBreakerConfig {
                failure_threshold: 1,
                max_retries: 0,
                call_timeout: Duration::from_millis(500),
                ..Default::default()
            }),
        };

        let result: RuntimeResult<()> = with_circuit_breaker(
            &registry,
            || async { Err(RuntimeError::execution("503")) },
            "flaky",
            CallContext::new("generate"),
            options,
        )
        .await;
        assert!(result.is_err());

        let breaker = registry.get("flaky").await.unwrap();
        assert_eq!(breaker.state().await, CircuitState::Open);

        let stats = registry.stats().await;
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].metrics.failed_requests, 1);

        assert!(registry.reset("flaky").await);
        assert!(!registry.reset("missing").await);
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }
}
