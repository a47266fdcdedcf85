//! Circuit breaker with per-call timeout and exponential-backoff retry.
//!
//! The whole attempt sequence of one `execute` counts as a single outcome for
//! the state machine: retries happen underneath, and only an exhausted call
//! (or a call that ran past `call_timeout`) records a failure.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use draftwork_config::{CircuitBreakerConfig, CircuitState};
use draftwork_errors::{RuntimeError, RuntimeResult};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CallPriority {
    High,
    #[default]
    Normal,
    Low,
}

/// Carried into logs and listener hooks. Priority does not change admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallContext {
    pub operation: String,
    pub priority: CallPriority,
}

impl CallContext {
    pub fn new<S: Into<String>>(operation: S) -> Self {
        Self {
            operation: operation.into(),
            priority: CallPriority::Normal,
        }
    }

    pub fn with_priority(mut self, priority: CallPriority) -> Self {
        self.priority = priority;
        self
    }
}

/// Observer hooks. Called after the breaker's lock is released.
pub trait CircuitBreakerListener: Send + Sync {
    fn on_success(&self, _service: &str, _context: &CallContext, _elapsed: Duration) {}
    fn on_failure(&self, _service: &str, _context: &CallContext, _error: &RuntimeError) {}
    fn on_state_change(&self, _service: &str, _from: CircuitState, _to: CircuitState) {}
    fn on_rejected(&self, _service: &str, _context: &CallContext) {}
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CircuitMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub rejected_requests: u64,
    pub total_response_time_ms: f64,
    pub average_response_time_ms: f64,
}

impl CircuitMetrics {
    fn record_response(&mut self, elapsed: Duration) {
        self.total_response_time_ms += elapsed.as_secs_f64() * 1000.0;
        let completed = self.successful_requests + self.failed_requests;
        if completed > 0 {
            self.average_response_time_ms = self.total_response_time_ms / completed as f64;
        }
    }

    pub fn failure_rate(&self) -> f64 {
        let completed = self.successful_requests + self.failed_requests;
        if completed == 0 {
            0.0
        } else {
            self.failed_requests as f64 / completed as f64
        }
    }
}

/// Point-in-time view of a circuit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerStats {
    pub service: String,
    pub state: CircuitState,
    pub consecutive_failures: usize,
    pub consecutive_successes: usize,
    /// Milliseconds since the last real attempt, if any
    pub last_attempt_ago_ms: Option<u64>,
    pub last_error: Option<String>,
    #[serde(with = "draftwork_config::duration_serde::millis")]
    pub current_reset_timeout: Duration,
    pub metrics: CircuitMetrics,
}

#[derive(Debug)]
struct CircuitData {
    state: CircuitState,
    consecutive_failures: usize,
    consecutive_successes: usize,
    last_attempt: Option<Instant>,
    last_error: Option<String>,
    current_reset_timeout: Duration,
    metrics: CircuitMetrics,
}

impl CircuitData {
    fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_attempt: None,
            last_error: None,
            current_reset_timeout: config.reset_timeout,
            metrics: CircuitMetrics::default(),
        }
    }

    fn reset_timeout_elapsed(&self, now: Instant) -> bool {
        match self.last_attempt {
            Some(at) => now.duration_since(at) >= self.current_reset_timeout,
            None => true,
        }
    }
}

type Transition = Option<(CircuitState, CircuitState)>;

/// Held by a call admitted while HALF_OPEN; frees its probe slot on drop,
/// including when the caller abandons the call.
struct ProbePermit {
    in_flight: Arc<AtomicUsize>,
}

impl Drop for ProbePermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

enum Admission {
    Allowed(Option<ProbePermit>),
    Rejected,
}

pub struct CircuitBreaker {
    service: String,
    config: CircuitBreakerConfig,
    data: Arc<RwLock<CircuitData>>,
    probes_in_flight: Arc<AtomicUsize>,
    listeners: Vec<Arc<dyn CircuitBreakerListener>>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("service", &self.service)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    pub fn new<S: Into<String>>(service: S, config: CircuitBreakerConfig) -> Self {
        let data = CircuitData::new(&config);
        Self {
            service: service.into(),
            config,
            data: Arc::new(RwLock::new(data)),
            probes_in_flight: Arc::new(AtomicUsize::new(0)),
            listeners: Vec::new(),
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn CircuitBreakerListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn with_listeners(mut self, listeners: &[Arc<dyn CircuitBreakerListener>]) -> Self {
        self.listeners.extend(listeners.iter().cloned());
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Runs `operation` under the breaker. `operation` is re-invoked for
    /// every retry, so it must build a fresh future each time.
    pub async fn execute<F, Fut, T>(&self, mut operation: F, context: CallContext) -> RuntimeResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RuntimeResult<T>>,
    {
        let (admission, transition) = self.admit().await;
        self.notify_transition(transition);

        let _probe = match admission {
            Admission::Allowed(probe) => probe,
            Admission::Rejected => {
                self.record_rejection(&context).await;
                return Err(RuntimeError::circuit_open(&self.service));
            }
        };

        let started = Instant::now();
        let outcome = match tokio::time::timeout(
            self.config.call_timeout,
            self.run_with_retries(&mut operation, &context),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(RuntimeError::timeout(format!(
                "{} {} 超过 {:?}",
                self.service, context.operation, self.config.call_timeout
            ))),
        };
        let elapsed = started.elapsed();

        match outcome {
            Ok(value) => {
                self.record_success(elapsed, &context).await;
                Ok(value)
            }
            Err(error) => {
                self.record_failure(&error, elapsed, &context).await;
                Err(error)
            }
        }
    }

    /// Delay before retry `attempt` (0-based).
    pub fn retry_delay_for(&self, attempt: u32) -> Duration {
        self.config
            .retry_delay
            .saturating_mul(1u32 << attempt.min(31))
    }

    async fn run_with_retries<F, Fut, T>(
        &self,
        operation: &mut F,
        context: &CallContext,
    ) -> RuntimeResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RuntimeResult<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(error) if attempt < self.config.max_retries && error.is_retryable() => {
                    let delay = self.retry_delay_for(attempt);
                    debug!(
                        service = %self.service,
                        operation = %context.operation,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying after error: {}",
                        error
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn admit(&self) -> (Admission, Transition) {
        {
            let data = self.data.read().await;
            match data.state {
                CircuitState::Closed => return (Admission::Allowed(None), None),
                CircuitState::HalfOpen => return (self.try_probe(), None),
                CircuitState::Open if !data.reset_timeout_elapsed(Instant::now()) => {
                    return (Admission::Rejected, None)
                }
                CircuitState::Open => {}
            }
        }

        let mut data = self.data.write().await;
        // re-check under the write lock, another caller may have moved it
        match data.state {
            CircuitState::Open if data.reset_timeout_elapsed(Instant::now()) => {
                data.state = CircuitState::HalfOpen;
                data.consecutive_successes = 0;
                (
                    self.try_probe(),
                    Some((CircuitState::Open, CircuitState::HalfOpen)),
                )
            }
            CircuitState::Open => (Admission::Rejected, None),
            CircuitState::HalfOpen => (self.try_probe(), None),
            CircuitState::Closed => (Admission::Allowed(None), None),
        }
    }

    /// HALF_OPEN lets at most `success_threshold` trial calls run at once.
    fn try_probe(&self) -> Admission {
        let limit = self.config.success_threshold.max(1);
        let acquired = self
            .probes_in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < limit).then_some(n + 1)
            })
            .is_ok();
        if acquired {
            Admission::Allowed(Some(ProbePermit {
                in_flight: Arc::clone(&self.probes_in_flight),
            }))
        } else {
            Admission::Rejected
        }
    }

    async fn record_rejection(&self, context: &CallContext) {
        {
            let mut data = self.data.write().await;
            data.metrics.total_requests += 1;
            data.metrics.rejected_requests += 1;
        }
        debug!(
            service = %self.service,
            operation = %context.operation,
            priority = ?context.priority,
            "Call rejected, circuit is open"
        );
        for listener in &self.listeners {
            listener.on_rejected(&self.service, context);
        }
    }

    async fn record_success(&self, elapsed: Duration, context: &CallContext) {
        let transition = {
            let mut data = self.data.write().await;
            data.last_attempt = Some(Instant::now());
            data.metrics.total_requests += 1;
            data.metrics.successful_requests += 1;
            data.metrics.record_response(elapsed);
            data.consecutive_failures = 0;

            match data.state {
                CircuitState::HalfOpen => {
                    data.consecutive_successes += 1;
                    if data.consecutive_successes >= self.config.success_threshold {
                        data.state = CircuitState::Closed;
                        data.consecutive_successes = 0;
                        data.current_reset_timeout = self.config.reset_timeout;
                        Some((CircuitState::HalfOpen, CircuitState::Closed))
                    } else {
                        None
                    }
                }
                _ => None,
            }
        };

        for listener in &self.listeners {
            listener.on_success(&self.service, context, elapsed);
        }
        self.notify_transition(transition);
    }

    async fn record_failure(&self, error: &RuntimeError, elapsed: Duration, context: &CallContext) {
        let transition = {
            let mut data = self.data.write().await;
            data.last_attempt = Some(Instant::now());
            data.last_error = Some(error.to_string());
            data.metrics.total_requests += 1;
            data.metrics.failed_requests += 1;
            data.metrics.record_response(elapsed);
            data.consecutive_failures += 1;
            data.consecutive_successes = 0;

            match data.state {
                CircuitState::Closed
                    if data.consecutive_failures >= self.config.failure_threshold =>
                {
                    data.state = CircuitState::Open;
                    data.current_reset_timeout = self.config.reset_timeout;
                    Some((CircuitState::Closed, CircuitState::Open))
                }
                CircuitState::HalfOpen => {
                    data.state = CircuitState::Open;
                    let grown = data
                        .current_reset_timeout
                        .mul_f64(self.config.recovery_backoff_multiplier);
                    data.current_reset_timeout = grown.min(self.config.max_reset_timeout);
                    Some((CircuitState::HalfOpen, CircuitState::Open))
                }
                _ => None,
            }
        };

        warn!(
            service = %self.service,
            operation = %context.operation,
            priority = ?context.priority,
            "Call failed: {}",
            error
        );
        for listener in &self.listeners {
            listener.on_failure(&self.service, context, error);
        }
        self.notify_transition(transition);
    }

    fn notify_transition(&self, transition: Transition) {
        if let Some((from, to)) = transition {
            match to {
                CircuitState::Open => warn!(service = %self.service, "熔断器状态变更: {} -> {}", from, to),
                _ => info!(service = %self.service, "熔断器状态变更: {} -> {}", from, to),
            }
            for listener in &self.listeners {
                listener.on_state_change(&self.service, from, to);
            }
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.data.read().await.state
    }

    pub async fn stats(&self) -> CircuitBreakerStats {
        let data = self.data.read().await;
        CircuitBreakerStats {
            service: self.service.clone(),
            state: data.state,
            consecutive_failures: data.consecutive_failures,
            consecutive_successes: data.consecutive_successes,
            last_attempt_ago_ms: data
                .last_attempt
                .map(|at| at.elapsed().as_millis() as u64),
            last_error: data.last_error.clone(),
            current_reset_timeout: data.current_reset_timeout,
            metrics: data.metrics.clone(),
        }
    }

    /// Back to CLOSED with fresh counters.
    pub async fn reset(&self) {
        let previous = {
            let mut data = self.data.write().await;
            let previous = data.state;
            *data = CircuitData::new(&self.config);
            previous
        };
        if previous != CircuitState::Closed {
            self.notify_transition(Some((previous, CircuitState::Closed)));
        }
    }

    /// Open the circuit for maintenance. The reset timeout starts now.
    pub async fn force_open(&self) {
        let previous = {
            let mut data = self.data.write().await;
            let previous = data.state;
            data.state = CircuitState::Open;
            data.last_attempt = Some(Instant::now());
            previous
        };
        if previous != CircuitState::Open {
            self.notify_transition(Some((previous, CircuitState::Open)));
        }
    }
}
