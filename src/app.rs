use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use draftwork_config::{AppConfig, ConfigValidator};
use draftwork_dispatcher::WorkerPool;
use draftwork_errors::RuntimeResult;
use draftwork_infrastructure::{
    with_circuit_breaker, CallContext, CircuitBreakerRegistry, CircuitCallOptions, TieredStorage,
};
use draftwork_worker::ExecutorRegistry;
use tracing::info;

/// 应用组合根: owns the worker pool, the circuit breakers and the storage
/// service, and tears them down together.
pub struct Application {
    config: AppConfig,
    circuit_breakers: Arc<CircuitBreakerRegistry>,
    pool: WorkerPool,
    storage: Arc<TieredStorage>,
}

impl Application {
    /// Builds every service with the built-in executors. Must run inside a
    /// tokio runtime.
    pub async fn new(config: AppConfig) -> Result<Self> {
        Self::with_executors(config, ExecutorRegistry::with_defaults()).await
    }

    pub async fn with_executors(config: AppConfig, executors: ExecutorRegistry) -> Result<Self> {
        config.validate().context("配置校验失败")?;
        info!("初始化应用程序");

        let circuit_breakers = Arc::new(CircuitBreakerRegistry::new(
            config.circuit_breaker.clone(),
        ));
        let storage = Arc::new(
            TieredStorage::from_registry(config.storage.clone(), &circuit_breakers).await,
        );
        let pool = WorkerPool::new(config.pool.clone(), Arc::new(executors));

        Ok(Self {
            config,
            circuit_breakers,
            pool,
            storage,
        })
    }

    /// Opens the durable store and starts storage maintenance. Returns whether
    /// the durable tier is available.
    pub async fn init(&self) -> bool {
        let durable = self.storage.init().await;
        self.storage.start_maintenance().await;
        info!(
            "应用程序初始化完成, durable storage: {}",
            if durable { "available" } else { "session fallback" }
        );
        durable
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn storage(&self) -> &Arc<TieredStorage> {
        &self.storage
    }

    pub fn circuit_breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.circuit_breakers
    }

    /// Runs `operation` behind the breaker registered for `service`.
    pub async fn call_protected<F, Fut, T>(
        &self,
        service: &str,
        context: CallContext,
        operation: F,
    ) -> RuntimeResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RuntimeResult<T>>,
    {
        with_circuit_breaker(
            &self.circuit_breakers,
            operation,
            service,
            context,
            CircuitCallOptions::default(),
        )
        .await
    }

    pub async fn shutdown(&self) {
        info!("开始关闭应用程序");
        self.pool.shutdown().await;
        self.storage.shutdown().await;
        info!("应用程序已关闭");
    }
}
