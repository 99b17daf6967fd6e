//! Retry and circuit-breaker policies
//!
//! A [`RecoveryPolicy`] wraps a fallible async operation with
//! retryable-error classification, configurable backoff, and an
//! optional circuit breaker. Two instances are typically configured:
//! one for LLM calls and one per tool family.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Delay growth between retries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStrategy {
    /// initial, 2×initial, 3×initial, ...
    Linear,
    /// initial, 2×initial, 4×initial, ...
    Exponential,
    /// Exponential with half-width random jitter
    JitteredExponential,
}

/// Circuit breaker parameters
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// How long the circuit stays open before trial calls
    pub cooldown: Duration,
    /// Trial calls admitted while half-open
    pub half_open_trial_count: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        CircuitBreakerConfig {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            half_open_trial_count: 1,
        }
    }
}

/// Recovery policy parameters
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub max_retries: u32,
    pub backoff: BackoffStrategy,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub circuit_breaker: Option<CircuitBreakerConfig>,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        RecoveryConfig {
            max_retries: 3,
            backoff: BackoffStrategy::JitteredExponential,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            circuit_breaker: Some(CircuitBreakerConfig::default()),
        }
    }
}

#[derive(Debug)]
enum BreakerState {
    Closed { consecutive_failures: u32 },
    Open { until: Instant },
    HalfOpen { admitted: u32, successes: u32 },
}

/// Context handed to the `before_retry` callback
pub struct RetryContext<'a> {
    pub error: &'a Error,
    pub op_name: &'a str,
    /// 1-based attempt that just failed
    pub attempt: u32,
}

type RetryablePredicate = Arc<dyn Fn(&Error) -> bool + Send + Sync>;
type RetryCallback = Arc<dyn Fn(&RetryContext<'_>) + Send + Sync>;
type RecoveredCallback = Arc<dyn Fn(&str, u32) + Send + Sync>;

/// Retry + circuit breaker wrapper for one family of operations
#[derive(Clone)]
pub struct RecoveryPolicy {
    name: String,
    config: RecoveryConfig,
    is_retryable: RetryablePredicate,
    before_retry: Option<RetryCallback>,
    on_recovered: Option<RecoveredCallback>,
    breaker: Arc<Mutex<BreakerState>>,
}

impl RecoveryPolicy {
    /// Create a policy; the default retryable predicate follows the
    /// error taxonomy.
    pub fn new(name: impl Into<String>, config: RecoveryConfig) -> Self {
        RecoveryPolicy {
            name: name.into(),
            config,
            is_retryable: Arc::new(Error::is_retryable),
            before_retry: None,
            on_recovered: None,
            breaker: Arc::new(Mutex::new(BreakerState::Closed {
                consecutive_failures: 0,
            })),
        }
    }

    /// Replace the retryable-error predicate
    pub fn with_retryable(mut self, predicate: impl Fn(&Error) -> bool + Send + Sync + 'static) -> Self {
        self.is_retryable = Arc::new(predicate);
        self
    }

    /// Invoked before each retry sleep
    pub fn on_before_retry(mut self, cb: impl Fn(&RetryContext<'_>) + Send + Sync + 'static) -> Self {
        self.before_retry = Some(Arc::new(cb));
        self
    }

    /// Invoked once when an operation succeeds after at least one retry
    pub fn on_recovered(mut self, cb: impl Fn(&str, u32) + Send + Sync + 'static) -> Self {
        self.on_recovered = Some(Arc::new(cb));
        self
    }

    /// Execute `f` under this policy
    pub async fn execute<T, F, Fut>(&self, op_name: &str, f: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            self.admit()?;

            match f().await {
                Ok(value) => {
                    self.record_success();
                    if attempt > 0 {
                        info!("Operation {} recovered after {} retries", op_name, attempt);
                        if let Some(ref cb) = self.on_recovered {
                            cb(op_name, attempt);
                        }
                    }
                    return Ok(value);
                }
                Err(error) => {
                    self.record_failure();

                    if attempt >= self.config.max_retries || !(self.is_retryable)(&error) {
                        return Err(error);
                    }

                    attempt += 1;
                    let delay = self.backoff_delay(attempt);
                    warn!(
                        "Operation {} failed (attempt {}): {}; retrying in {:?}",
                        op_name, attempt, error, delay
                    );
                    if let Some(ref cb) = self.before_retry {
                        cb(&RetryContext {
                            error: &error,
                            op_name,
                            attempt,
                        });
                    }
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Delay before retry `attempt` (1-based)
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let initial = self.config.initial_delay;
        let raw = match self.config.backoff {
            BackoffStrategy::Linear => initial.saturating_mul(attempt),
            BackoffStrategy::Exponential => {
                initial.saturating_mul(1u32 << (attempt - 1).min(16))
            }
            BackoffStrategy::JitteredExponential => {
                let base = initial.saturating_mul(1u32 << (attempt - 1).min(16));
                let half = base / 2;
                let jitter = rand::rng().random_range(0.0..=1.0);
                half + Duration::from_secs_f64(half.as_secs_f64() * jitter)
            }
        };
        raw.min(self.config.max_delay)
    }

    /// Gate a call through the circuit breaker
    fn admit(&self) -> Result<()> {
        let Some(ref cb_config) = self.config.circuit_breaker else {
            return Ok(());
        };
        let mut state = self.breaker.lock().expect("breaker lock");

        match *state {
            BreakerState::Closed { .. } => Ok(()),
            BreakerState::Open { until } => {
                if Instant::now() >= until {
                    debug!("Circuit {} cooling down, admitting trial call", self.name);
                    *state = BreakerState::HalfOpen {
                        admitted: 1,
                        successes: 0,
                    };
                    Ok(())
                } else {
                    Err(Error::CircuitOpen(self.name.clone()))
                }
            }
            BreakerState::HalfOpen { admitted, successes } => {
                if admitted < cb_config.half_open_trial_count {
                    *state = BreakerState::HalfOpen {
                        admitted: admitted + 1,
                        successes,
                    };
                    Ok(())
                } else {
                    Err(Error::CircuitOpen(self.name.clone()))
                }
            }
        }
    }

    fn record_success(&self) {
        let Some(ref cb_config) = self.config.circuit_breaker else {
            return;
        };
        let mut state = self.breaker.lock().expect("breaker lock");
        match *state {
            BreakerState::Closed { .. } => {
                *state = BreakerState::Closed {
                    consecutive_failures: 0,
                };
            }
            BreakerState::HalfOpen { admitted, successes } => {
                let successes = successes + 1;
                if successes >= cb_config.half_open_trial_count {
                    info!("Circuit {} closed after successful trials", self.name);
                    *state = BreakerState::Closed {
                        consecutive_failures: 0,
                    };
                } else {
                    *state = BreakerState::HalfOpen { admitted, successes };
                }
            }
            BreakerState::Open { .. } => {}
        }
    }

    fn record_failure(&self) {
        let Some(ref cb_config) = self.config.circuit_breaker else {
            return;
        };
        let mut state = self.breaker.lock().expect("breaker lock");
        match *state {
            BreakerState::Closed { consecutive_failures } => {
                let failures = consecutive_failures + 1;
                if failures >= cb_config.failure_threshold {
                    warn!(
                        "Circuit {} opened after {} consecutive failures",
                        self.name, failures
                    );
                    *state = BreakerState::Open {
                        until: Instant::now() + cb_config.cooldown,
                    };
                } else {
                    *state = BreakerState::Closed {
                        consecutive_failures: failures,
                    };
                }
            }
            BreakerState::HalfOpen { .. } => {
                warn!("Circuit {} trial call failed, reopening", self.name);
                *state = BreakerState::Open {
                    until: Instant::now() + cb_config.cooldown,
                };
            }
            BreakerState::Open { .. } => {}
        }
    }
}
