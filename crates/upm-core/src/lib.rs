pub mod circuit_breaker;
pub mod clock;
pub mod error;
pub mod reporter;
pub mod retry;
mod util;

#[cfg(test)]
pub(crate) mod testutil;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
pub use clock::{Clock, SystemClock};
pub use error::{AppError, ErrorCategory, ErrorCode, PublicError, classify};
pub use reporter::{NoopReporter, ResilienceEvent, ResilienceReporter, TracingReporter};
pub use retry::{RetryConfig, RetryExecutor, retry};
