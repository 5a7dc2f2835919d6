use crate::backend::{Completion, CompletionBackend, CompletionRequest};
use async_trait::async_trait;
use conclave_core::{ConclaveError, ConclaveResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Configures retry behaviour for transient backend errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries per backend before moving to the next one.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Maximum delay in milliseconds (cap for exponential backoff).
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

fn default_max_retries() -> u32 {
    2
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

/// Computes the backoff delay for a given attempt using exponential backoff
/// capped at `max_ms`.
pub fn compute_backoff(base_ms: u64, max_ms: u64, attempt: u32) -> u64 {
    let delay = base_ms.saturating_mul(2u64.saturating_pow(attempt));
    delay.min(max_ms)
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failed requests that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// How long the circuit stays open before a trial request is let through.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown_secs() -> u64 {
    30
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

/// A [`CompletionBackend`] that wraps one or more backends with retries,
/// failover, and a circuit breaker.
///
/// For each request it tries backends in order. Within each backend it retries
/// up to `max_retries` times for transient errors. Once `failure_threshold`
/// requests in a row have failed on every backend, the circuit opens and
/// requests fail fast until the cooldown elapses.
pub struct ResilientBackend {
    backends: Vec<Arc<dyn CompletionBackend>>,
    policy: RetryPolicy,
    circuit: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl ResilientBackend {
    /// Wrap a primary backend.
    pub fn new(primary: Arc<dyn CompletionBackend>, policy: RetryPolicy) -> Self {
        Self {
            backends: vec![primary],
            policy,
            circuit: CircuitBreakerConfig::default(),
            state: Mutex::new(BreakerState::default()),
        }
    }

    /// Add a fallback backend tried after the previous ones are exhausted.
    pub fn with_fallback(mut self, backend: Arc<dyn CompletionBackend>) -> Self {
        self.backends.push(backend);
        self
    }

    /// Override the circuit breaker thresholds.
    pub fn with_circuit(mut self, circuit: CircuitBreakerConfig) -> Self {
        self.circuit = circuit;
        self
    }

    /// Whether the circuit is currently rejecting requests.
    pub fn is_open(&self) -> bool {
        let state = self.state.lock();
        state.open_until.is_some_and(|until| Instant::now() < until)
    }

    fn check_circuit(&self) -> ConclaveResult<()> {
        let mut state = self.state.lock();
        match state.open_until {
            Some(until) if Instant::now() < until => Err(ConclaveError::Backend(
                "circuit open: completion backend is cooling down".into(),
            )),
            Some(_) => {
                // Half-open: let one request through; a failure re-opens immediately.
                state.open_until = None;
                state.consecutive_failures = self.circuit.failure_threshold.saturating_sub(1);
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn record_success(&self) {
        let mut state = self.state.lock();
        state.consecutive_failures = 0;
        state.open_until = None;
    }

    fn record_failure(&self) {
        let mut state = self.state.lock();
        state.consecutive_failures += 1;
        if state.consecutive_failures >= self.circuit.failure_threshold {
            warn!(
                failures = state.consecutive_failures,
                cooldown_secs = self.circuit.cooldown_secs,
                "Opening completion circuit"
            );
            state.open_until = Some(Instant::now() + Duration::from_secs(self.circuit.cooldown_secs));
        }
    }
}

#[async_trait]
impl CompletionBackend for ResilientBackend {
    async fn complete(&self, request: CompletionRequest) -> ConclaveResult<Completion> {
        self.check_circuit()?;

        let mut last_err: Option<ConclaveError> = None;

        for (backend_idx, backend) in self.backends.iter().enumerate() {
            for attempt in 0..=self.policy.max_retries {
                match backend.complete(request.clone()).await {
                    Ok(completion) => {
                        self.record_success();
                        return Ok(completion);
                    }
                    Err(e) => {
                        if !e.is_transient() {
                            warn!(
                                backend = backend_idx,
                                attempt,
                                error = %e,
                                "Non-retryable error, moving to next backend"
                            );
                            last_err = Some(e);
                            break;
                        }

                        if attempt < self.policy.max_retries {
                            let delay = compute_backoff(
                                self.policy.backoff_base_ms,
                                self.policy.backoff_max_ms,
                                attempt,
                            );
                            info!(
                                backend = backend_idx,
                                attempt,
                                delay_ms = delay,
                                error = %e,
                                "Retryable error, backing off"
                            );
                            tokio::time::sleep(Duration::from_millis(delay)).await;
                        }
                        last_err = Some(e);
                    }
                }
            }
        }

        self.record_failure();
        Err(last_err
            .unwrap_or_else(|| ConclaveError::Backend("All completion backends exhausted".into())))
    }
}
