//! The `PolicyExecutor` contract every concrete policy implements.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::execution::Execution;
use crate::result::ExecutionResult;

/// Predicate over an attempt's outcome, classifying it as "a failure for
/// this policy" (spec.md §4.1: "a result is a failure for policy P iff P's
/// classifier matches either `failure` or `value`").
pub type Classifier<T, E> =
    Arc<dyn Fn(Option<&T>, Option<&crate::error::ResilienceError<E>>) -> bool + Send + Sync>;

/// The composition-so-far, as a callable step: invoking it runs everything
/// inside the current policy (spec.md §4.3's `innerFn`).
pub type StepFn<T, E> =
    Arc<dyn for<'a> Fn(&'a Execution<T, E>) -> BoxFuture<'a, ExecutionResult<T, E>> + Send + Sync>;

/// Per-call adaptor wrapping one policy around an inner function.
///
/// This is a single uniform dispatch point rather than an inheritance
/// hierarchy, per the REDESIGN FLAGS resolution for "dynamic dispatch over
/// policies via inheritance": every concrete policy (`RetryExecutor`,
/// `CircuitBreakerExecutor`, `TimeoutExecutor`, `FallbackExecutor`,
/// `BulkheadExecutor`, `RateLimiterExecutor`) implements this trait directly
/// and is driven by the single composition dispatcher in `stack.rs`, which
/// plays the role spec.md §4.3 assigns to `apply`.
#[async_trait]
pub trait PolicyExecutor<T, E>: Send + Sync
where
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    /// Position in the composed stack; 0 is innermost. Assigned by the
    /// `ResilienceStackBuilder` at build time.
    fn policy_index(&self) -> usize;

    /// Called before the inner function. Returning `Some(result)`
    /// short-circuits the attempt — used by circuit breaker (open),
    /// bulkhead (full), and rate limiter (denied) to reject without ever
    /// invoking the wrapped operation.
    async fn pre_execute(&self, _execution: &Execution<T, E>) -> Option<ExecutionResult<T, E>> {
        None
    }

    /// Does this policy consider `result` a failure? Defaults to the
    /// result's own `is_failure()` flag; policies with a configurable
    /// classifier (retry's `should_retry`, circuit breaker's failure
    /// predicate) override this.
    fn classify(&self, result: &ExecutionResult<T, E>) -> bool {
        result.is_failure()
    }

    /// Notify the policy of a successful result. No transform.
    fn on_success(&self, _execution: &Execution<T, E>, _result: &ExecutionResult<T, E>) {}

    /// Handle a result this policy classifies as a failure. May return a
    /// retry request (`complete = false`, `wait() > 0`), a transformed
    /// success (fallback), or the result unchanged.
    async fn on_failure(
        &self,
        execution: &Execution<T, E>,
        result: ExecutionResult<T, E>,
    ) -> ExecutionResult<T, E>;

    /// Release any resource acquired in `pre_execute` (bulkhead permit,
    /// rate-limiter token) once a result has been recorded, regardless of
    /// success or failure. Most policies have nothing to release.
    fn release(&self, _execution: &Execution<T, E>) {}

    /// Invoke the inner step. Almost every policy just awaits `inner`
    /// directly (the default); `TimeoutExecutor` overrides this to race
    /// `inner` against a deadline instead, since a timeout must wrap the
    /// invocation itself rather than merely inspect its result.
    async fn invoke<'a>(
        &'a self,
        execution: &'a Execution<T, E>,
        inner: StepFn<T, E>,
    ) -> ExecutionResult<T, E> {
        inner(execution).await
    }
}
