#![forbid(unsafe_code)]

//! # resilience-engine
//!
//! A composable resilience execution engine: retry, circuit breaker, timeout,
//! fallback, bulkhead, and rate limiter policies folded into a single
//! pipeline with ordered composition, cooperative cancellation, and
//! externally-signalled (out-of-band) completion.
//!
//! ## Features
//!
//! - **Retry** with pluggable backoff/jitter, abort classifiers, and a
//!   wall-clock budget.
//! - **Circuit breaker** with windowed ("m of n") failure tracking and
//!   half-open trial recovery.
//! - **Timeout** with cooperative cancellation into the running attempt.
//! - **Fallback** substituting a value or transformed failure.
//! - **Bulkhead** bounding in-flight concurrency.
//! - **Rate limiter**, smooth (token bucket) or bursty (fixed window).
//! - **Composition** via an ordered `ResilienceStack`, either ordering of
//!   retry and circuit breaker, ordering is caller-chosen and observable.
//! - **Cancellation** of an in-flight async execution via `FailsafeFuture`,
//!   invoking every registered policy cancel function exactly once.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//! use std::time::Duration;
//! use resilience_engine::{Backoff, Jitter, ResilienceError, ResilienceStackBuilder, RetryPolicy};
//!
//! async fn flaky_operation(
//!     attempts: Arc<AtomicUsize>,
//! ) -> Result<(), ResilienceError<std::io::Error>> {
//!     let n = attempts.fetch_add(1, Ordering::Relaxed);
//!     if n < 2 {
//!         Err(ResilienceError::Inner(std::io::Error::new(
//!             std::io::ErrorKind::Other,
//!             "transient failure",
//!         )))
//!     } else {
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), ResilienceError<std::io::Error>> {
//!     let attempts = Arc::new(AtomicUsize::new(0));
//!
//!     let retry = RetryPolicy::builder()
//!         .max_attempts(3)
//!         .expect("valid attempt count")
//!         .backoff(Backoff::exponential(Duration::from_millis(200)))
//!         .with_jitter(Jitter::full())
//!         .build();
//!
//!     // Retry (outer) wrapping CircuitBreaker (inner): retries see the
//!     // breaker's own rejections as ordinary retryable failures.
//!     let stack = ResilienceStackBuilder::new()
//!         .retry(retry)
//!         .circuit_breaker(5, Duration::from_secs(30))
//!         .expect("valid breaker config")
//!         .build();
//!
//!     stack.execute(move || flaky_operation(attempts.clone())).await?;
//!     Ok(())
//! }
//! ```

mod backoff;
mod bulkhead;
mod circuit_breaker;
mod clock;
mod error;
mod execution;
mod fallback;
mod future;
mod jitter;
mod policy;
pub mod rate_limit;
mod result;
mod retry;
mod scheduler;
mod sleeper;
mod stack;
pub mod telemetry;
mod timeout;

pub use backoff::Backoff;
pub use bulkhead::{BulkheadExecutor, BulkheadPolicy};
pub use circuit_breaker::{
    CircuitBreakerConfig, CircuitBreakerConfigError, CircuitBreakerExecutor, CircuitBreakerPolicy,
    CircuitState, Threshold,
};
pub use clock::{Clock, MonotonicClock};
pub use error::{ResilienceError, MAX_RETRY_FAILURES};
pub use execution::{AsyncExecution, Execution, InterruptState, RetryBudget};
pub use fallback::{FallbackExecutor, FallbackOutcome, FallbackPolicy};
pub use future::{pair, FailsafeFuture, FailsafeFutureHandle, ORCHESTRATION_INDEX};
pub use jitter::Jitter;
pub use policy::{Classifier, PolicyExecutor, StepFn};
pub use rate_limit::{
    Decision, FixedWindowLimiter, InMemoryTokenStore, RateLimiter, RateLimiterConfigError,
    TokenBucket,
};
pub use result::{AttemptOutcome, ExecutionResult};
pub use retry::{BuildError, RetryExecutor, RetryPolicy, RetryPolicyBuilder};
pub use scheduler::{ScheduledTask, Scheduler, TokioScheduler};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use stack::{ResilienceStack, ResilienceStackBuilder};
pub use timeout::{TimeoutConfigError, TimeoutExecutor, TimeoutPolicy, MAX_TIMEOUT};
