//! The outcome of a single execution attempt.

use std::fmt;
use std::time::Duration;

use crate::error::ResilienceError;

/// Immutable-in-spirit record of one attempt's outcome.
///
/// Modeled as a consuming builder rather than a literal copy-on-write value:
/// every `with_*` method takes `self` by value and returns a new `Self`, so
/// callers chain transformations (`result.with_wait(d).with_not_complete()`)
/// without requiring `T: Clone`. Exactly one of `value` / `failure` is ever
/// populated.
pub struct ExecutionResult<T, E> {
    value: Option<T>,
    failure: Option<ResilienceError<E>>,
    /// The pipeline accepts this as final; no further retry re-entry.
    complete: bool,
    /// Whether the originating policy considers this outcome non-failing.
    success: bool,
    /// Delay the orchestrator should wait before the next attempt.
    wait: Duration,
    /// Forces termination regardless of any policy's wish to retry further.
    abortive: bool,
}

impl<T, E> ExecutionResult<T, E> {
    /// A successful outcome. Complete by default; policies override via `with_*`.
    pub fn success(value: T) -> Self {
        Self {
            value: Some(value),
            failure: None,
            complete: true,
            success: true,
            wait: Duration::ZERO,
            abortive: false,
        }
    }

    /// A failed outcome. Complete by default; policies override via `with_*`.
    pub fn failure(failure: ResilienceError<E>) -> Self {
        Self {
            value: None,
            failure: Some(failure),
            complete: true,
            success: false,
            wait: Duration::ZERO,
            abortive: false,
        }
    }

    /// Attach a wait duration, used by retry-like policies to request a delay
    /// before the orchestrator re-enters the inner function.
    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    /// Mark this result as complete: the composition accepts it as final.
    pub fn with_complete(mut self) -> Self {
        self.complete = true;
        self
    }

    /// Mark this result as not complete: the orchestrator should re-enter the
    /// inner function (after waiting `wait_nanos()`, if any) rather than
    /// surface this result to the caller.
    pub fn with_not_complete(mut self) -> Self {
        self.complete = false;
        self
    }

    /// Force termination regardless of any remaining retry budget.
    pub fn with_abort(mut self) -> Self {
        self.complete = true;
        self.abortive = true;
        self
    }

    /// The successful value, if any.
    pub fn value(&self) -> Option<&T> {
        self.value.as_ref()
    }

    /// The failure, if any.
    pub fn failure_ref(&self) -> Option<&ResilienceError<E>> {
        self.failure.as_ref()
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn is_failure(&self) -> bool {
        !self.success
    }

    pub fn is_abortive(&self) -> bool {
        self.abortive
    }

    pub fn wait(&self) -> Duration {
        self.wait
    }

    /// Consume the result, splitting it into its value/failure halves.
    pub fn into_parts(self) -> (Option<T>, Option<ResilienceError<E>>) {
        (self.value, self.failure)
    }

    /// Convert into a plain `Result`, discarding the retry metadata. Intended
    /// for the boundary where a composed stack hands its final, complete
    /// result back to the caller.
    pub fn into_result(self) -> Result<T, ResilienceError<E>> {
        match (self.value, self.failure) {
            (Some(v), _) => Ok(v),
            (None, Some(f)) => Err(f),
            (None, None) => unreachable!("ExecutionResult has neither value nor failure"),
        }
    }

    /// Debug-oriented textual summary, matching spec's `toSummary()`.
    pub fn to_summary(&self) -> String
    where
        E: fmt::Display,
    {
        format!(
            "ExecutionResult{{success={}, complete={}, abortive={}, wait={:?}, failure={}}}",
            self.success,
            self.complete,
            self.abortive,
            self.wait,
            self.failure.as_ref().map(|f| f.to_string()).unwrap_or_else(|| "none".to_string())
        )
    }
}

impl<T, E> fmt::Debug for ExecutionResult<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionResult")
            .field("has_value", &self.value.is_some())
            .field("has_failure", &self.failure.is_some())
            .field("complete", &self.complete)
            .field("success", &self.success)
            .field("wait", &self.wait)
            .field("abortive", &self.abortive)
            .finish()
    }
}

/// The result of invoking a `PolicyExecutor`'s `apply` dispatcher: either the
/// terminal result is ready, or it will arrive later via an out-of-band
/// `record(...)` call (spec's `NULL_FUTURE` sentinel).
pub enum AttemptOutcome<T, E> {
    Ready(ExecutionResult<T, E>),
    Pending,
}

impl<T, E> AttemptOutcome<T, E> {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    pub fn into_ready(self) -> Option<ExecutionResult<T, E>> {
        match self {
            Self::Ready(r) => Some(r),
            Self::Pending => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn success_is_complete_by_default() {
        let r: ExecutionResult<i32, io::Error> = ExecutionResult::success(42);
        assert!(r.is_complete());
        assert!(r.is_success());
        assert_eq!(r.value(), Some(&42));
    }

    #[test]
    fn with_not_complete_requests_retry() {
        let r: ExecutionResult<i32, io::Error> =
            ExecutionResult::failure(ResilienceError::Cancelled)
                .with_wait(Duration::from_millis(50))
                .with_not_complete();
        assert!(!r.is_complete());
        assert_eq!(r.wait(), Duration::from_millis(50));
    }

    #[test]
    fn with_abort_forces_complete() {
        let r: ExecutionResult<i32, io::Error> =
            ExecutionResult::failure(ResilienceError::Cancelled).with_abort();
        assert!(r.is_complete());
        assert!(r.is_abortive());
    }

    #[test]
    fn into_result_round_trips_success() {
        let r: ExecutionResult<i32, io::Error> = ExecutionResult::success(7);
        assert_eq!(r.into_result().unwrap(), 7);
    }

    #[test]
    fn attempt_outcome_pending_has_no_ready_value() {
        let outcome: AttemptOutcome<i32, io::Error> = AttemptOutcome::Pending;
        assert!(outcome.is_pending());
        assert!(outcome.into_ready().is_none());
    }
}
