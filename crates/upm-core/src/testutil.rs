//! Test utilities: handwritten mocks for the resilience components.
//!
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::circuit_breaker::CircuitState;
use crate::clock::Clock;
use crate::error::AppError;
use crate::reporter::{ResilienceEvent, ResilienceReporter};

// ---------------------------------------------------------------------------
// ManualClock
// ---------------------------------------------------------------------------

/// Clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<Instant>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap()
    }
}

// ---------------------------------------------------------------------------
// ScriptedOperation
// ---------------------------------------------------------------------------

/// Operation that replays a queue of outcomes.
///
/// Each call pops the first element. Once the queue is empty it keeps
/// returning `fallback`, or `Ok("ok")` when no fallback is set.
#[derive(Clone)]
pub struct ScriptedOperation {
    outcomes: Arc<Mutex<Vec<Result<&'static str, AppError>>>>,
    fallback: Option<AppError>,
    attempts: Arc<Mutex<Vec<u32>>>,
}

impl ScriptedOperation {
    pub fn succeeding() -> Self {
        Self::with_outcomes(Vec::new())
    }

    pub fn with_outcomes(outcomes: Vec<Result<&'static str, AppError>>) -> Self {
        Self {
            outcomes: Arc::new(Mutex::new(outcomes)),
            fallback: None,
            attempts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Fails `failures` times with `error`, then succeeds.
    pub fn failing_then_ok(failures: usize, error: AppError) -> Self {
        Self::with_outcomes(vec![Err(error); failures])
    }

    pub fn always_failing(error: AppError) -> Self {
        Self {
            fallback: Some(error),
            ..Self::succeeding()
        }
    }

    pub async fn call(&self, attempt: u32) -> Result<&'static str, AppError> {
        self.attempts.lock().unwrap().push(attempt);
        let mut outcomes = self.outcomes.lock().unwrap();
        if outcomes.is_empty() {
            match &self.fallback {
                Some(err) => Err(err.clone()),
                None => Ok("ok"),
            }
        } else {
            outcomes.remove(0)
        }
    }

    /// Attempt numbers seen so far, in call order.
    pub fn attempts(&self) -> Vec<u32> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }
}

// ---------------------------------------------------------------------------
// RecordingReporter
// ---------------------------------------------------------------------------

/// Reporter that keeps the interesting bits of every event.
#[derive(Debug, Clone, Default)]
pub struct RecordingReporter {
    delays: Arc<Mutex<Vec<Duration>>>,
    failures: Arc<Mutex<Vec<(u32, bool)>>>,
    transitions: Arc<Mutex<Vec<(CircuitState, CircuitState)>>>,
    rejections: Arc<Mutex<usize>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delays(&self) -> Vec<Duration> {
        self.delays.lock().unwrap().clone()
    }

    /// `(attempt, will_retry)` for every failed attempt.
    pub fn failures(&self) -> Vec<(u32, bool)> {
        self.failures.lock().unwrap().clone()
    }

    pub fn transitions(&self) -> Vec<(CircuitState, CircuitState)> {
        self.transitions.lock().unwrap().clone()
    }

    pub fn rejections(&self) -> usize {
        *self.rejections.lock().unwrap()
    }
}

impl ResilienceReporter for RecordingReporter {
    fn report(&self, event: ResilienceEvent<'_>) {
        match event {
            ResilienceEvent::BackingOff { delay, .. } => {
                self.delays.lock().unwrap().push(delay);
            }
            ResilienceEvent::AttemptFailed {
                attempt,
                will_retry,
                ..
            } => {
                self.failures.lock().unwrap().push((attempt, will_retry));
            }
            ResilienceEvent::CircuitTransition { from, to, .. } => {
                self.transitions.lock().unwrap().push((from, to));
            }
            ResilienceEvent::CircuitRejected { .. } => {
                *self.rejections.lock().unwrap() += 1;
            }
            ResilienceEvent::RetrySucceeded { .. } | ResilienceEvent::RetryCancelled { .. } => {}
        }
    }
}
