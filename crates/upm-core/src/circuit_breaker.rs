//! Circuit breaker guarding calls to a failing dependency.
//!
//! # Circuit States
//!
//! ```text
//! CLOSED (healthy) --[threshold failures]--> OPEN (rejecting) --[reset timeout]--> HALF_OPEN (probing)
//!                                              ^                                        |
//!                                              +-------------[probe failure]------------+
//!                                                                                       |
//! CLOSED <-------------------------------[probe success]--------------------------------+
//! ```
//!
//! State is checked and updated under a mutex when a call enters and when
//! it finishes. The guarded operation itself runs without the lock.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::clock::{Clock, SystemClock};
use crate::error::{AppError, BoxError, ErrorCode};
use crate::reporter::{ResilienceEvent, ResilienceReporter, TracingReporter};
use crate::util::{duration_millis, millis};

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed - requests flow normally.
    Closed,
    /// Circuit is open - requests are rejected immediately.
    Open,
    /// Circuit is half-open - limited requests allowed to test recovery.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit.
    pub failure_threshold: u32,

    /// Time to wait before transitioning from Open to Half-Open.
    #[serde(with = "duration_millis")]
    pub reset_timeout: Duration,

    /// Probes admitted in Half-Open before the circuit gives up and reopens.
    pub half_open_max_attempts: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            half_open_max_attempts: 3,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.failure_threshold == 0 {
            return Err(AppError::new(
                ErrorCode::ConfigError,
                "circuit breaker failure_threshold must be at least 1",
            ));
        }
        if self.half_open_max_attempts == 0 {
            return Err(AppError::new(
                ErrorCode::ConfigError,
                "circuit breaker half_open_max_attempts must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Internal state tracking for the circuit breaker.
#[derive(Debug)]
struct CircuitBreakerInner {
    state: CircuitState,
    failure_count: u32,
    last_failure_time: Option<Instant>,
    half_open_attempts: u32,
}

impl CircuitBreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_time: None,
            half_open_attempts: 0,
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.last_failure_time = Some(now);
    }
}

/// Statistics about circuit breaker state for monitoring.
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub half_open_attempts: u32,
    pub time_until_half_open: Option<Duration>,
}

type Transition = Option<(CircuitState, CircuitState)>;

/// Thread-safe circuit breaker. Clones share state.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<CircuitBreakerInner>>,
    clock: Arc<dyn Clock>,
    reporter: Arc<dyn ResilienceReporter>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Arc::new(Mutex::new(CircuitBreakerInner::new())),
            clock: Arc::new(SystemClock),
            reporter: Arc::new(TracingReporter),
        }
    }

    pub fn with_settings(
        name: impl Into<String>,
        failure_threshold: u32,
        reset_timeout: Duration,
        half_open_max_attempts: u32,
    ) -> Self {
        Self::new(
            name,
            CircuitBreakerConfig {
                failure_threshold,
                reset_timeout,
                half_open_max_attempts,
            },
        )
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ResilienceReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Acquires the inner mutex lock, recovering from poison if necessary.
    fn lock_inner(&self) -> std::sync::MutexGuard<'_, CircuitBreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(circuit = %self.name, "Recovered from poisoned mutex");
            poisoned.into_inner()
        })
    }

    pub fn state(&self) -> CircuitState {
        self.lock_inner().state
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.lock_inner();
        let time_until_half_open = match (inner.state, inner.last_failure_time) {
            (CircuitState::Open, Some(t)) => Some(
                self.config
                    .reset_timeout
                    .saturating_sub(self.clock.now().saturating_duration_since(t)),
            ),
            _ => None,
        };

        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            half_open_attempts: inner.half_open_attempts,
            time_until_half_open,
        }
    }

    /// Executes the given operation through the circuit breaker.
    ///
    /// - Closed: executes operation, tracks success/failure
    /// - Open: rejects with `SERVICE_UNAVAILABLE` until the reset timeout
    ///   has passed, then lets this call through as a Half-Open probe
    /// - HalfOpen: executes operation, transitions based on result
    ///
    /// Failures that are not already an [`AppError`] are classified by
    /// message before being returned.
    ///
    /// The outcome is recorded against the state at completion, not at
    /// admission: a call admitted while Closed that succeeds after the
    /// circuit went Half-Open closes it, even with a probe still in flight.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, AppError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        self.admit()?;

        let result = operation().await.map_err(AppError::from_failure);

        match &result {
            Ok(_) => self.record_success(),
            Err(_) => self.record_failure(),
        }

        result
    }

    /// Decide whether a call may run, updating state on the way in.
    fn admit(&self) -> Result<(), AppError> {
        let mut inner = self.lock_inner();
        let now = self.clock.now();

        let (verdict, transition) = match inner.state {
            CircuitState::Closed => (Ok(()), None),
            CircuitState::Open => {
                let recovered = inner.last_failure_time.is_none_or(|t| {
                    now.saturating_duration_since(t) > self.config.reset_timeout
                });
                if recovered {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_attempts = 1;
                    (Ok(()), Some((CircuitState::Open, CircuitState::HalfOpen)))
                } else {
                    let remaining = inner.last_failure_time.map_or(Duration::ZERO, |t| {
                        self.config
                            .reset_timeout
                            .saturating_sub(now.saturating_duration_since(t))
                    });
                    let err = AppError::new(
                        ErrorCode::ServiceUnavailable,
                        format!("circuit breaker '{}' is open", self.name),
                    )
                    .add_metadata("circuit", self.name.as_str())
                    .add_metadata("retry_after_ms", millis(remaining));
                    (Err(err), None)
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_attempts >= self.config.half_open_max_attempts {
                    inner.open(now);
                    let err = AppError::new(
                        ErrorCode::ServiceUnavailable,
                        format!(
                            "circuit breaker '{}' half-open attempts exhausted",
                            self.name
                        ),
                    )
                    .add_metadata("circuit", self.name.as_str());
                    (
                        Err(err),
                        Some((CircuitState::HalfOpen, CircuitState::Open)),
                    )
                } else {
                    inner.half_open_attempts += 1;
                    (Ok(()), None)
                }
            }
        };
        let state = inner.state;
        drop(inner);

        self.report_transition(transition);
        if verdict.is_err() {
            self.reporter.report(ResilienceEvent::CircuitRejected {
                circuit: &self.name,
                state,
            });
        }
        verdict
    }

    pub fn record_success(&self) {
        let mut inner = self.lock_inner();

        let transition = match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
                None
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.failure_count = 0;
                inner.half_open_attempts = 0;
                Some((CircuitState::HalfOpen, CircuitState::Closed))
            }
            CircuitState::Open => None,
        };
        drop(inner);

        self.report_transition(transition);
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock_inner();
        let now = self.clock.now();

        let transition = match inner.state {
            CircuitState::Closed => {
                inner.failure_count = inner.failure_count.saturating_add(1);
                if inner.failure_count >= self.config.failure_threshold {
                    tracing::warn!(
                        circuit = %self.name,
                        failures = inner.failure_count,
                        "Circuit breaker opening after {} consecutive failures",
                        inner.failure_count
                    );
                    inner.open(now);
                    Some((CircuitState::Closed, CircuitState::Open))
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!(
                    circuit = %self.name,
                    "Circuit breaker probe failed, returning to open state"
                );
                inner.open(now);
                inner.failure_count = self.config.failure_threshold;
                Some((CircuitState::HalfOpen, CircuitState::Open))
            }
            CircuitState::Open => None,
        };
        drop(inner);

        self.report_transition(transition);
    }

    pub fn reset(&self) {
        let mut inner = self.lock_inner();
        tracing::info!(circuit = %self.name, "Circuit breaker manually reset");
        let from = inner.state;
        *inner = CircuitBreakerInner::new();
        drop(inner);

        if from != CircuitState::Closed {
            self.report_transition(Some((from, CircuitState::Closed)));
        }
    }

    fn report_transition(&self, transition: Transition) {
        if let Some((from, to)) = transition {
            self.reporter.report(ResilienceEvent::CircuitTransition {
                circuit: &self.name,
                from,
                to,
            });
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}
