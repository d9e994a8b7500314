//! Observability hooks for the retry executor and circuit breaker.
//!
//! Neither component logs on its own: both hold a [`ResilienceReporter`]
//! handed to them at construction and describe what happened through
//! [`ResilienceEvent`]s.

use std::time::Duration;

use crate::circuit_breaker::CircuitState;
use crate::error::AppError;

/// Events emitted while guarding or retrying an operation.
#[derive(Debug, Clone)]
pub enum ResilienceEvent<'a> {
    AttemptFailed {
        attempt: u32,
        max_attempts: u32,
        error: &'a AppError,
        will_retry: bool,
    },
    BackingOff {
        attempt: u32,
        delay: Duration,
    },
    RetrySucceeded {
        attempts: u32,
    },
    RetryCancelled {
        attempts: u32,
    },
    CircuitTransition {
        circuit: &'a str,
        from: CircuitState,
        to: CircuitState,
    },
    CircuitRejected {
        circuit: &'a str,
        state: CircuitState,
    },
}

/// Receives resilience events (decoupled logging).
pub trait ResilienceReporter: Send + Sync {
    fn report(&self, event: ResilienceEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReporter;

impl ResilienceReporter for NoopReporter {}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ResilienceReporter for TracingReporter {
    fn report(&self, event: ResilienceEvent<'_>) {
        match event {
            ResilienceEvent::AttemptFailed {
                attempt,
                max_attempts,
                error,
                will_retry,
            } => {
                tracing::warn!(
                    attempt,
                    max_attempts,
                    error_code = %error.code(),
                    %error,
                    will_retry,
                    "Attempt failed"
                );
            }
            ResilienceEvent::BackingOff { attempt, delay } => {
                tracing::debug!(
                    attempt,
                    delay_ms = %delay.as_millis(),
                    "Backing off before next attempt"
                );
            }
            ResilienceEvent::RetrySucceeded { attempts } => {
                tracing::info!(attempts, "Operation succeeded after retrying");
            }
            ResilienceEvent::RetryCancelled { attempts } => {
                tracing::warn!(attempts, "Retry cancelled");
            }
            ResilienceEvent::CircuitTransition { circuit, from, to } => {
                tracing::info!(%circuit, %from, %to, "Circuit breaker state changed");
            }
            ResilienceEvent::CircuitRejected { circuit, state } => {
                tracing::debug!(%circuit, %state, "Circuit breaker rejected call");
            }
        }
    }
}
