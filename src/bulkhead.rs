//! Bulkhead: caps the number of concurrent in-flight attempts.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use crate::error::ResilienceError;
use crate::execution::Execution;
use crate::policy::{PolicyExecutor, StepFn};
use crate::result::ExecutionResult;
use crate::telemetry::{BulkheadEvent, Emitter, PolicyEvent};

/// Non-blocking concurrency limiter: rejects immediately rather than
/// queueing when the limit is reached (spec.md §4.8's "no blocking"
/// default).
#[derive(Clone)]
pub struct BulkheadPolicy {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
    emitter: Option<Emitter>,
}

impl BulkheadPolicy {
    pub fn new(max_concurrent: usize) -> Self {
        Self { semaphore: Arc::new(Semaphore::new(max_concurrent)), max_concurrent, emitter: None }
    }

    /// A bulkhead that never rejects. `Semaphore::MAX_PERMITS` is
    /// approximately `usize::MAX / 4`; a billion permits is large enough to
    /// be effectively unbounded without risking that ceiling.
    pub fn unlimited() -> Self {
        Self::new(1_000_000_000)
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Emit a `PolicyEvent::Bulkhead` on every acquire and rejection.
    pub fn with_telemetry(mut self, emitter: Emitter) -> Self {
        self.emitter = Some(emitter);
        self
    }

    fn emit(&self, event: BulkheadEvent) {
        if let Some(emitter) = &self.emitter {
            emitter(PolicyEvent::Bulkhead(event));
        }
    }

    pub async fn execute<T, E, Fut, Op>(&self, operation: Op) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
        Op: FnOnce() -> Fut,
    {
        let available = self.semaphore.available_permits();
        let in_flight = self.max_concurrent.saturating_sub(available);

        let permit = match self.semaphore.try_acquire() {
            Ok(permit) => {
                self.emit(BulkheadEvent::Acquired {
                    active_count: in_flight + 1,
                    max_concurrency: self.max_concurrent,
                });
                permit
            }
            Err(_) => {
                self.emit(BulkheadEvent::Rejected {
                    active_count: in_flight,
                    max_concurrency: self.max_concurrent,
                });
                return Err(ResilienceError::Bulkhead { in_flight, max: self.max_concurrent });
            }
        };

        let result = operation().await;
        drop(permit);
        result
    }
}

/// Adapts `BulkheadPolicy` to the `PolicyExecutor` contract. Overrides
/// `invoke` rather than `pre_execute`/`release` so the acquired permit's
/// lifetime is scoped to the inner call with an ordinary `drop`, instead of
/// needing side storage keyed by execution.
pub struct BulkheadExecutor<T, E> {
    policy: BulkheadPolicy,
    policy_index: usize,
    _marker: std::marker::PhantomData<fn() -> (T, E)>,
}

impl<T, E> BulkheadExecutor<T, E> {
    pub fn new(policy: BulkheadPolicy, policy_index: usize) -> Self {
        Self { policy, policy_index, _marker: std::marker::PhantomData }
    }
}

#[async_trait]
impl<T, E> PolicyExecutor<T, E> for BulkheadExecutor<T, E>
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
        result
    }

    async fn invoke<'a>(
        &'a self,
        execution: &'a Execution<T, E>,
        inner: StepFn<T, E>,
    ) -> ExecutionResult<T, E> {
        let available = self.policy.semaphore.available_permits();
        let in_flight = self.policy.max_concurrent.saturating_sub(available);
        match self.policy.semaphore.try_acquire() {
            Ok(permit) => {
                self.policy.emit(BulkheadEvent::Acquired {
                    active_count: in_flight + 1,
                    max_concurrency: self.policy.max_concurrent,
                });
                let result = inner(execution).await;
                drop(permit);
                result
            }
            Err(_) => {
                self.policy.emit(BulkheadEvent::Rejected {
                    active_count: in_flight,
                    max_concurrency: self.policy.max_concurrent,
                });
                ExecutionResult::failure(ResilienceError::Bulkhead {
                    in_flight,
                    max: self.policy.max_concurrent,
                })
                .with_complete()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    type Err = ResilienceError<io::Error>;

    #[tokio::test]
    async fn allows_within_limit() {
        let bulkhead = BulkheadPolicy::new(3);
        for _ in 0..3 {
            let result: Result<i32, Err> = bulkhead.execute(|| async { Ok(1) }).await;
            assert!(result.is_ok());
        }
    }

    #[tokio::test]
    async fn rejects_when_full() {
        let bulkhead = BulkheadPolicy::new(1);
        let barrier = Arc::new(tokio::sync::Barrier::new(2));
        let held = bulkhead.clone();
        let held_barrier = barrier.clone();
        let holder = tokio::spawn(async move {
            held.execute(|| async move {
                held_barrier.wait().await;
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok::<_, Err>(())
            })
            .await
        });
        barrier.wait().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let rejected: Result<(), Err> = bulkhead.execute(|| async { Ok(()) }).await;
        assert!(rejected.unwrap_err().is_bulkhead());
        let _ = holder.await.unwrap();
    }

    #[tokio::test]
    async fn releases_permit_after_completion() {
        let bulkhead = BulkheadPolicy::new(1);
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let count = count.clone();
            let result: Result<(), Err> = bulkhead
                .execute(|| async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await;
            assert!(result.is_ok());
        }
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn telemetry_emits_acquired_and_rejected() {
        use crate::telemetry::PolicyEvent;
        use std::sync::Mutex as StdMutex;

        let events: Arc<StdMutex<Vec<PolicyEvent>>> = Arc::new(StdMutex::new(Vec::new()));
        let events_clone = events.clone();
        let bulkhead = BulkheadPolicy::new(1)
            .with_telemetry(Arc::new(move |event| events_clone.lock().unwrap().push(event)));

        let _permit = bulkhead.semaphore.clone().try_acquire_owned().unwrap();
        let rejected: Result<(), Err> = bulkhead.execute(|| async { Ok(()) }).await;
        assert!(rejected.unwrap_err().is_bulkhead());
        assert!(matches!(
            events.lock().unwrap().as_slice(),
            [PolicyEvent::Bulkhead(BulkheadEvent::Rejected { .. })]
        ));
    }

    #[tokio::test]
    async fn unlimited_never_rejects() {
        let bulkhead = BulkheadPolicy::unlimited();
        let handles: Vec<_> = (0..50)
            .map(|_| {
                let bulkhead = bulkhead.clone();
                tokio::spawn(async move {
                    bulkhead
                        .execute(|| async {
                            tokio::time::sleep(Duration::from_millis(5)).await;
                            Ok::<_, Err>(())
                        })
                        .await
                })
            })
            .collect();
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
    }
}
