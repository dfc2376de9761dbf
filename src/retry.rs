//! Retry policy: re-attempts a failing operation with backoff and jitter.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::backoff::Backoff;
use crate::error::{ResilienceError, MAX_RETRY_FAILURES};
use crate::execution::Execution;
use crate::jitter::Jitter;
use crate::policy::PolicyExecutor;
use crate::result::ExecutionResult;
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::telemetry::{Emitter, PolicyEvent, RetryEvent};

/// Errors building an invalid `RetryPolicy`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    InvalidMaxAttempts,
    InvalidMaxDuration,
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidMaxAttempts => write!(f, "max_attempts must be at least 1"),
            Self::InvalidMaxDuration => write!(f, "max_duration must be greater than zero"),
        }
    }
}

impl std::error::Error for BuildError {}

/// Configuration and classifiers for re-attempting a failing operation.
///
/// `max_attempts = None` means unlimited attempts (bounded only by
/// `max_duration`, if set); this is spec.md §4.4's `maxAttempts = -1`
/// sentinel, translated into an idiomatic `Option`.
pub struct RetryPolicy<E> {
    max_attempts: Option<usize>,
    max_duration: Option<Duration>,
    backoff: Backoff,
    jitter: Jitter,
    should_retry: Arc<dyn Fn(&E) -> bool + Send + Sync>,
    abort_on: Option<Arc<dyn Fn(&E) -> bool + Send + Sync>>,
    sleeper: Arc<dyn Sleeper>,
    emitter: Option<Emitter>,
}

impl<E> Clone for RetryPolicy<E> {
    fn clone(&self) -> Self {
        Self {
            max_attempts: self.max_attempts,
            max_duration: self.max_duration,
            backoff: self.backoff.clone(),
            jitter: self.jitter.clone(),
            should_retry: self.should_retry.clone(),
            abort_on: self.abort_on.clone(),
            sleeper: self.sleeper.clone(),
            emitter: self.emitter.clone(),
        }
    }
}

impl<E> fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("max_duration", &self.max_duration)
            .field("backoff", &self.backoff)
            .field("jitter", &self.jitter)
            .finish()
    }
}

impl<E> RetryPolicy<E> {
    pub fn builder() -> RetryPolicyBuilder<E> {
        RetryPolicyBuilder::new()
    }

    fn is_abort(&self, err: &E) -> bool {
        self.abort_on.as_ref().is_some_and(|f| f(err))
    }

    fn is_retryable(&self, err: &E) -> bool {
        (self.should_retry)(err)
    }

    fn next_delay(&self, attempt: usize, elapsed: Duration) -> Duration {
        let mut delay = self.jitter.apply(self.backoff.delay(attempt));
        if let Some(max_duration) = self.max_duration {
            delay = delay.min(max_duration.saturating_sub(elapsed));
        }
        delay
    }

    fn emit(&self, event: RetryEvent) {
        if let Some(emitter) = &self.emitter {
            emitter(PolicyEvent::Retry(event));
        }
    }

    /// Run `op`, retrying on classified-retryable `Inner` failures until
    /// success, an abort classifier fires, or the attempt/duration budget is
    /// exhausted (surfaced as `RetryExhausted`). Non-`Inner` errors (policy
    /// rejections from an inner layer) pass through unretried.
    pub async fn execute<T, Fut, Op>(&self, mut op: Op) -> Result<T, ResilienceError<E>>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
    {
        let start = Instant::now();
        let mut attempt = 0usize;
        let mut failures: Vec<E> = Vec::new();

        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(ResilienceError::Inner(err)) => {
                    if self.is_abort(&err) {
                        return Err(ResilienceError::Inner(err));
                    }
                    if !self.is_retryable(&err) {
                        return Err(ResilienceError::Inner(err));
                    }

                    let elapsed = start.elapsed();
                    let attempts_exhausted =
                        self.max_attempts.is_some_and(|max| attempt >= max);
                    let duration_exhausted =
                        self.max_duration.is_some_and(|max| elapsed >= max);

                    if failures.len() < MAX_RETRY_FAILURES {
                        failures.push(err);
                    }

                    if attempts_exhausted || duration_exhausted {
                        self.emit(RetryEvent::Exhausted {
                            total_attempts: attempt,
                            total_duration: elapsed,
                        });
                        return Err(ResilienceError::RetryExhausted { attempts: attempt, failures });
                    }

                    let delay = self.next_delay(attempt, elapsed);
                    self.emit(RetryEvent::Attempt { attempt, delay });
                    self.sleeper.sleep(delay).await;
                }
                Err(other) => return Err(other),
            }
        }
    }
}

/// Builds a `RetryPolicy`.
pub struct RetryPolicyBuilder<E> {
    max_attempts: Option<usize>,
    max_duration: Option<Duration>,
    backoff: Backoff,
    jitter: Jitter,
    should_retry: Arc<dyn Fn(&E) -> bool + Send + Sync>,
    abort_on: Option<Arc<dyn Fn(&E) -> bool + Send + Sync>>,
    sleeper: Arc<dyn Sleeper>,
    emitter: Option<Emitter>,
}

impl<E> Default for RetryPolicyBuilder<E> {
    fn default() -> Self {
        Self {
            max_attempts: Some(3),
            max_duration: None,
            backoff: Backoff::constant(Duration::from_millis(100)),
            jitter: Jitter::None,
            should_retry: Arc::new(|_| true),
            abort_on: None,
            sleeper: Arc::new(TokioSleeper),
            emitter: None,
        }
    }
}

impl<E> RetryPolicyBuilder<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of attempts (must be at least 1).
    pub fn max_attempts(mut self, attempts: usize) -> Result<Self, BuildError> {
        if attempts == 0 {
            return Err(BuildError::InvalidMaxAttempts);
        }
        self.max_attempts = Some(attempts);
        Ok(self)
    }

    /// Allow unlimited attempts, bounded only by `max_duration` if set.
    pub fn unlimited_attempts(mut self) -> Self {
        self.max_attempts = None;
        self
    }

    /// Set a wall-clock budget across all attempts.
    pub fn max_duration(mut self, duration: Duration) -> Result<Self, BuildError> {
        if duration.is_zero() {
            return Err(BuildError::InvalidMaxDuration);
        }
        self.max_duration = Some(duration);
        Ok(self)
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Classify which errors should be retried at all (defaults to all).
    pub fn should_retry<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Arc::new(predicate);
        self
    }

    /// Classify errors that should abort immediately, skipping any
    /// remaining retry budget.
    pub fn abort_on<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.abort_on = Some(Arc::new(predicate));
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Emit a `PolicyEvent::Retry` on every attempt and on exhaustion.
    pub fn with_telemetry(mut self, emitter: Emitter) -> Self {
        self.emitter = Some(emitter);
        self
    }

    pub fn build(self) -> RetryPolicy<E> {
        RetryPolicy {
            max_attempts: self.max_attempts,
            max_duration: self.max_duration,
            backoff: self.backoff,
            jitter: self.jitter,
            should_retry: self.should_retry,
            abort_on: self.abort_on,
            sleeper: self.sleeper,
            emitter: self.emitter,
        }
    }
}

/// Adapts `RetryPolicy` to the `PolicyExecutor` contract for composed
/// stacks. Attempt counting and elapsed-time tracking are read from the
/// shared `Execution` context rather than kept locally, since one
/// `RetryExecutor` instance is shared across concurrent executions.
pub struct RetryExecutor<E> {
    policy: RetryPolicy<E>,
    policy_index: usize,
}

impl<E> RetryExecutor<E> {
    pub fn new(policy: RetryPolicy<E>, policy_index: usize) -> Self {
        Self { policy, policy_index }
    }
}

#[async_trait]
impl<T, E> PolicyExecutor<T, E> for RetryExecutor<E>
where
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    fn policy_index(&self) -> usize {
        self.policy_index
    }

    async fn on_failure(
        &self,
        execution: &Execution<T, E>,
        result: ExecutionResult<T, E>,
    ) -> ExecutionResult<T, E> {
        let Some(err) = result.failure_ref() else {
            return result.with_complete();
        };
        let ResilienceError::Inner(inner) = err else {
            // Policy rejections from inner layers (circuit open, bulkhead
            // full, timeout, rate limited) are retried as ordinary failures
            // unless the caller's classifier says otherwise.
            return self.decide(execution, result, None);
        };
        if self.policy.is_abort(inner) {
            return result.with_abort();
        }
        if !self.policy.is_retryable(inner) {
            return result.with_complete();
        }
        self.decide(execution, result, None)
    }
}

impl<E> RetryExecutor<E> {
    fn decide<T>(
        &self,
        execution: &Execution<T, E>,
        result: ExecutionResult<T, E>,
        _unused: Option<()>,
    ) -> ExecutionResult<T, E> {
        let attempt = execution.attempts();
        let elapsed = execution.elapsed();
        let attempts_exhausted = self.policy.max_attempts.is_some_and(|max| attempt >= max);
        let duration_exhausted = self.policy.max_duration.is_some_and(|max| elapsed >= max);
        if attempts_exhausted || duration_exhausted {
            self.policy.emit(RetryEvent::Exhausted {
                total_attempts: attempt,
                total_duration: elapsed,
            });
            return result.with_complete();
        }
        let delay = self.policy.next_delay(attempt, elapsed);
        self.policy.emit(RetryEvent::Attempt { attempt, delay });
        result.with_wait(delay).with_not_complete()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sleeper::InstantSleeper;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Boom;

    impl fmt::Display for Boom {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "boom")
        }
    }
    impl std::error::Error for Boom {}

    #[tokio::test]
    async fn succeeds_without_retry() {
        let policy = RetryPolicy::builder()
            .max_attempts(3)
            .unwrap()
            .with_sleeper(Arc::new(InstantSleeper))
            .build();
        let result: Result<i32, ResilienceError<Boom>> =
            policy.execute(|| async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn retries_until_exhausted() {
        let policy: RetryPolicy<Boom> = RetryPolicy::builder()
            .max_attempts(3)
            .unwrap()
            .with_sleeper(Arc::new(InstantSleeper))
            .build();
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();
        let result: Result<i32, ResilienceError<Boom>> = policy
            .execute(move || {
                attempts_clone.fetch_add(1, Ordering::SeqCst);
                async { Err(ResilienceError::Inner(Boom)) }
            })
            .await;
        assert!(result.unwrap_err().is_retry_exhausted());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn abort_classifier_short_circuits() {
        let policy: RetryPolicy<Boom> = RetryPolicy::builder()
            .max_attempts(5)
            .unwrap()
            .abort_on(|_| true)
            .with_sleeper(Arc::new(InstantSleeper))
            .build();
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();
        let result: Result<i32, ResilienceError<Boom>> = policy
            .execute(move || {
                attempts_clone.fetch_add(1, Ordering::SeqCst);
                async { Err(ResilienceError::Inner(Boom)) }
            })
            .await;
        assert!(matches!(result, Err(ResilienceError::Inner(Boom))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_inner_errors_pass_through_unretried() {
        let policy: RetryPolicy<Boom> = RetryPolicy::builder()
            .max_attempts(5)
            .unwrap()
            .with_sleeper(Arc::new(InstantSleeper))
            .build();
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();
        let result: Result<i32, ResilienceError<Boom>> = policy
            .execute(move || {
                attempts_clone.fetch_add(1, Ordering::SeqCst);
                async { Err(ResilienceError::Cancelled) }
            })
            .await;
        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn zero_max_attempts_rejected() {
        let result = RetryPolicyBuilder::<Boom>::new().max_attempts(0);
        assert_eq!(result.unwrap_err(), BuildError::InvalidMaxAttempts);
    }

    #[tokio::test]
    async fn telemetry_emits_attempt_and_exhausted() {
        use crate::telemetry::PolicyEvent;
        use std::sync::Mutex as StdMutex;

        let events: Arc<StdMutex<Vec<PolicyEvent>>> = Arc::new(StdMutex::new(Vec::new()));
        let events_clone = events.clone();
        let policy: RetryPolicy<Boom> = RetryPolicy::builder()
            .max_attempts(2)
            .unwrap()
            .with_sleeper(Arc::new(InstantSleeper))
            .with_telemetry(Arc::new(move |event| events_clone.lock().unwrap().push(event)))
            .build();

        let _: Result<i32, ResilienceError<Boom>> =
            policy.execute(|| async { Err(ResilienceError::Inner(Boom)) }).await;

        let recorded = events.lock().unwrap();
        assert_eq!(recorded.len(), 2);
        assert!(matches!(recorded[0], PolicyEvent::Retry(RetryEvent::Attempt { .. })));
        assert!(matches!(recorded[1], PolicyEvent::Retry(RetryEvent::Exhausted { .. })));
    }
}
