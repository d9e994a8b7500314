//! Retry with exponential backoff and jitter.
//!
//! # Delay schedule
//!
//! ```text
//! attempt 1 ──fail──> sleep(initial)          ──> attempt 2
//! attempt 2 ──fail──> sleep(initial × m)      ──> attempt 3
//! attempt n ──fail──> sleep(initial × m^(n-1)) capped at max_delay
//! last attempt ──fail──> INTERNAL_ERROR "failed after N attempts"
//! ```
//!
//! Jitter scales each delay by a factor drawn uniformly from [0.9, 1.1].
//! The random source is a [`StdRng`] owned by the executor, so a fixed seed
//! gives a reproducible schedule.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, BoxError, ErrorCode};
use crate::reporter::{ResilienceEvent, ResilienceReporter, TracingReporter};
use crate::util::duration_millis;

/// Largest relative perturbation applied by jitter.
const JITTER_FACTOR: f64 = 0.1;

/// Retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of invocations, including the first.
    pub max_attempts: u32,

    /// Delay after the first failure.
    #[serde(with = "duration_millis")]
    pub initial_delay: Duration,

    /// Upper bound for any single delay.
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,

    /// Growth factor between consecutive delays.
    pub multiplier: f64,

    /// Randomise each delay by up to ±10%.
    pub jitter: bool,

    /// Codes that may be retried. Empty means every code is retryable.
    pub retryable_codes: HashSet<ErrorCode>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: true,
            retryable_codes: ErrorCode::ALL
                .into_iter()
                .filter(ErrorCode::is_retryable_by_default)
                .collect(),
        }
    }
}

impl RetryConfig {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_retryable_codes(mut self, codes: impl IntoIterator<Item = ErrorCode>) -> Self {
        self.retryable_codes = codes.into_iter().collect();
        self
    }

    /// Treat every failure as retryable.
    pub fn retry_all(mut self) -> Self {
        self.retryable_codes.clear();
        self
    }

    pub fn is_retryable(&self, code: ErrorCode) -> bool {
        self.retryable_codes.is_empty() || self.retryable_codes.contains(&code)
    }

    /// Delay before retry number `retry_index + 1`, without jitter.
    ///
    /// `min(initial_delay × multiplier^retry_index, max_delay)`
    pub fn base_delay(&self, retry_index: u32) -> Duration {
        let exponent = i32::try_from(retry_index).unwrap_or(i32::MAX);
        let nanos = self.initial_delay.as_nanos() as f64 * self.multiplier.powi(exponent);
        let cap = self.max_delay.as_nanos() as f64;

        if !nanos.is_finite() || nanos >= cap {
            return self.max_delay;
        }
        Duration::from_nanos(nanos.max(0.0).round() as u64)
    }

    /// [`base_delay`](Self::base_delay) with jitter applied when enabled.
    ///
    /// The result never exceeds `max_delay`.
    pub fn delay_for<R: Rng>(&self, retry_index: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(retry_index);
        if !self.jitter || base.is_zero() {
            return base;
        }

        let offset: f64 = rng.gen_range(-JITTER_FACTOR..=JITTER_FACTOR);
        let nanos = base.as_nanos() as f64 * (1.0 + offset);
        Duration::from_nanos(nanos.round() as u64).min(self.max_delay)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.max_attempts == 0 {
            return Err(AppError::new(
                ErrorCode::ConfigError,
                "retry max_attempts must be at least 1",
            ));
        }
        if !self.multiplier.is_finite() || self.multiplier <= 0.0 {
            return Err(AppError::new(
                ErrorCode::ConfigError,
                format!("retry multiplier must be positive, got {}", self.multiplier),
            ));
        }
        if self.initial_delay > self.max_delay {
            return Err(AppError::new(
                ErrorCode::ConfigError,
                format!(
                    "retry initial_delay ({:?}) exceeds max_delay ({:?})",
                    self.initial_delay, self.max_delay
                ),
            ));
        }
        Ok(())
    }
}

/// Runs operations under a [`RetryConfig`].
pub struct RetryExecutor {
    config: RetryConfig,
    rng: Mutex<StdRng>,
    reporter: Arc<dyn ResilienceReporter>,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            rng: Mutex::new(StdRng::from_entropy()),
            reporter: Arc::new(TracingReporter),
        }
    }

    /// Seed the jitter source for a reproducible delay schedule.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ResilienceReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Invoke `operation` until it succeeds, fails with a non-retryable
    /// code, runs out of attempts, or `cancel` fires.
    ///
    /// `operation` receives the 1-based attempt number. Failures that are
    /// not already an [`AppError`] are classified by message. The terminal
    /// error always wraps the last failure:
    /// - `INTERNAL_ERROR` "non-retryable error after N attempts"
    /// - `INTERNAL_ERROR` "failed after N attempts"
    /// - `TIMEOUT` when cancelled
    pub async fn run<F, Fut, T, E>(
        &self,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T, AppError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut last_error: Option<AppError> = None;
        let mut attempt = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(self.cancelled(attempt, last_error));
            }
            attempt += 1;

            let error = match operation(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        self.reporter
                            .report(ResilienceEvent::RetrySucceeded { attempts: attempt });
                    }
                    return Ok(value);
                }
                Err(failure) => AppError::from_failure(failure),
            };

            if !self.config.is_retryable(error.code()) {
                self.report_failure(attempt, max_attempts, &error, false);
                return Err(AppError::wrap(
                    error,
                    ErrorCode::InternalError,
                    format!("non-retryable error after {attempt} attempts"),
                ));
            }

            if attempt >= max_attempts {
                self.report_failure(attempt, max_attempts, &error, false);
                return Err(AppError::wrap(
                    error,
                    ErrorCode::InternalError,
                    format!("failed after {max_attempts} attempts"),
                ));
            }

            self.report_failure(attempt, max_attempts, &error, true);
            let delay = self.next_delay(attempt - 1);
            self.reporter
                .report(ResilienceEvent::BackingOff { attempt, delay });

            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    return Err(self.cancelled(attempt, Some(error)));
                }
                () = tokio::time::sleep(delay) => {}
            }

            last_error = Some(error);
        }
    }

    fn next_delay(&self, retry_index: u32) -> Duration {
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned retry rng mutex");
            poisoned.into_inner()
        });
        self.config.delay_for(retry_index, &mut *rng)
    }

    fn report_failure(&self, attempt: u32, max_attempts: u32, error: &AppError, will_retry: bool) {
        self.reporter.report(ResilienceEvent::AttemptFailed {
            attempt,
            max_attempts,
            error,
            will_retry,
        });
    }

    fn cancelled(&self, attempts: u32, last_error: Option<AppError>) -> AppError {
        self.reporter
            .report(ResilienceEvent::RetryCancelled { attempts });
        match last_error {
            Some(error) => AppError::wrap(
                error,
                ErrorCode::Timeout,
                format!("cancelled during retry delay after {attempts} attempts"),
            ),
            None => AppError::new(ErrorCode::Timeout, "retry cancelled before the first attempt"),
        }
    }
}

/// Run `operation` under `config` with a fresh [`RetryExecutor`].
pub async fn retry<F, Fut, T, E>(
    config: RetryConfig,
    cancel: &CancellationToken,
    operation: F,
) -> Result<T, AppError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Into<BoxError>,
{
    RetryExecutor::new(config).run(cancel, operation).await
}
