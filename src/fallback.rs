//! Fallback: substitutes a value or transformed failure for a failed result.
//!
//! No teacher counterpart — grounded on the general `PolicyExecutor` shape
//! (spec.md §4.7) plus the retry/fallback layering shown in
//! `other_examples/` for the same composition idiom.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ResilienceError;
use crate::execution::Execution;
use crate::policy::PolicyExecutor;
use crate::result::ExecutionResult;

/// Outcome a fallback function substitutes for a failed attempt.
pub enum FallbackOutcome<T, E> {
    Value(T),
    Failure(ResilienceError<E>),
}

/// Configuration for a fallback policy: a function from the failing result
/// to a substitute outcome. Always terminal (`complete = true`); fallback
/// never itself retries.
pub struct FallbackPolicy<T, E> {
    fallback_fn: Arc<dyn Fn(&ExecutionResult<T, E>) -> FallbackOutcome<T, E> + Send + Sync>,
}

impl<T, E> Clone for FallbackPolicy<T, E> {
    fn clone(&self) -> Self {
        Self { fallback_fn: self.fallback_fn.clone() }
    }
}

impl<T, E> FallbackPolicy<T, E> {
    pub fn new<F>(fallback_fn: F) -> Self
    where
        F: Fn(&ExecutionResult<T, E>) -> FallbackOutcome<T, E> + Send + Sync + 'static,
    {
        Self { fallback_fn: Arc::new(fallback_fn) }
    }

    /// A fallback that always substitutes the same value.
    pub fn of_value(value: T) -> Self
    where
        T: Clone + Send + Sync + 'static,
        E: Send + Sync + 'static,
    {
        Self::new(move |_result| FallbackOutcome::Value(value.clone()))
    }

    /// A fallback that computes a substitute failure from the original one.
    pub fn of_failure<F>(map: F) -> Self
    where
        F: Fn(&ResilienceError<E>) -> ResilienceError<E> + Send + Sync + 'static,
        T: Send + Sync + 'static,
        E: Send + Sync + 'static,
    {
        Self::new(move |result| match result.failure_ref() {
            Some(failure) => FallbackOutcome::Failure(map(failure)),
            None => FallbackOutcome::Failure(ResilienceError::Cancelled),
        })
    }
}

pub struct FallbackExecutor<T, E> {
    policy: FallbackPolicy<T, E>,
    policy_index: usize,
}

impl<T, E> FallbackExecutor<T, E> {
    pub fn new(policy: FallbackPolicy<T, E>, policy_index: usize) -> Self {
        Self { policy, policy_index }
    }
}

#[async_trait]
impl<T, E> PolicyExecutor<T, E> for FallbackExecutor<T, E>
where
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    fn policy_index(&self) -> usize {
        self.policy_index
    }

    async fn on_failure(
        &self,
        _execution: &Execution<T, E>,
        result: ExecutionResult<T, E>,
    ) -> ExecutionResult<T, E> {
        match (self.policy.fallback_fn)(&result) {
            FallbackOutcome::Value(value) => ExecutionResult::success(value).with_complete(),
            FallbackOutcome::Failure(failure) => {
                ExecutionResult::failure(failure).with_complete()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[tokio::test]
    async fn substitutes_value_on_failure() {
        let fallback: FallbackPolicy<&'static str, io::Error> = FallbackPolicy::of_value("x");
        let executor = FallbackExecutor::new(fallback, 0);
        let execution: Execution<&'static str, io::Error> = Execution::new();
        let failed = ExecutionResult::failure(ResilienceError::Cancelled);
        let result = executor.on_failure(&execution, failed).await;
        assert!(result.is_complete());
        assert_eq!(result.value(), Some(&"x"));
    }

    #[tokio::test]
    async fn transforms_failure() {
        let fallback: FallbackPolicy<i32, io::Error> =
            FallbackPolicy::of_failure(|_| ResilienceError::Cancelled);
        let executor = FallbackExecutor::new(fallback, 0);
        let execution: Execution<i32, io::Error> = Execution::new();
        let failed = ExecutionResult::failure(ResilienceError::Timeout {
            elapsed: std::time::Duration::from_secs(1),
            timeout: std::time::Duration::from_millis(100),
        });
        let result = executor.on_failure(&execution, failed).await;
        assert!(result.is_complete());
        assert!(result.failure_ref().unwrap().is_cancelled());
    }
}
