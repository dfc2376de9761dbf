//! Composition engine: folds an ordered list of policies into one pipeline.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::trace;

use crate::bulkhead::{BulkheadExecutor, BulkheadPolicy};
use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerConfigError, CircuitBreakerExecutor, CircuitBreakerPolicy};
use crate::error::ResilienceError;
use crate::execution::{AsyncExecution, Execution};
use crate::fallback::{FallbackExecutor, FallbackPolicy};
use crate::future::{pair, FailsafeFuture, ORCHESTRATION_INDEX};
use crate::policy::{PolicyExecutor, StepFn};
use crate::rate_limit::{RateLimiter, RateLimiterExecutor};
use crate::result::{AttemptOutcome, ExecutionResult};
use crate::retry::{RetryExecutor, RetryPolicy};
use crate::scheduler::{Scheduler, TokioScheduler};
use crate::timeout::{TimeoutConfigError, TimeoutExecutor, TimeoutPolicy};

/// Runs one policy's hooks around `inner`, implementing the generic
/// algorithm spec.md §4.3 assigns to `apply`: `pre_execute` may
/// short-circuit; otherwise `inner` runs (via `invoke`, which most policies
/// leave as a plain await and `TimeoutExecutor`/`BulkheadExecutor` override);
/// a classified failure routes through `on_failure`, looping back to
/// `invoke` again when the result comes back `not complete` (after waiting
/// `result.wait()`), which is how a retry-like policy re-enters its inner
/// function without any inheritance between policy types.
///
/// Checked at the top of every loop iteration and after every wait: once
/// the whole execution has been cancelled (spec.md §5, §8 scenario 6), no
/// further attempt runs and no policy's `on_failure`/`invoke` fires again.
async fn run_policy<T, E>(
    executor: Arc<dyn PolicyExecutor<T, E>>,
    execution: Execution<T, E>,
    inner: StepFn<T, E>,
    scheduler: Arc<dyn Scheduler>,
) -> ExecutionResult<T, E>
where
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    loop {
        if execution.is_cancelled() {
            return ExecutionResult::failure(ResilienceError::Cancelled);
        }

        if let Some(pre) = executor.pre_execute(&execution).await {
            let routed = executor.on_failure(&execution, pre).await;
            if !routed.is_complete() {
                if wait_if_any(&execution, &scheduler, routed.wait()).await {
                    return ExecutionResult::failure(ResilienceError::Cancelled);
                }
                continue;
            }
            return routed;
        }

        let result = executor.invoke(&execution, inner.clone()).await;

        if executor.classify(&result) {
            let routed = executor.on_failure(&execution, result).await;
            if !routed.is_complete() {
                if wait_if_any(&execution, &scheduler, routed.wait()).await {
                    return ExecutionResult::failure(ResilienceError::Cancelled);
                }
                continue;
            }
            return routed;
        } else {
            executor.on_success(&execution, &result);
            return result;
        }
    }
}

/// Waits out a retry delay, racing it against the execution's
/// whole-execution cancellation signal. Returns `true` if cancellation won
/// the race — the caller must stop re-entering the inner function rather
/// than waiting out the rest of the delay. The delay itself is submitted to
/// `scheduler` (not slept on the calling task inline) so a long retry
/// backoff never blocks a worker thread on the async path (spec.md §4.2).
async fn wait_if_any<T, E>(
    execution: &Execution<T, E>,
    scheduler: &Arc<dyn Scheduler>,
    wait: Duration,
) -> bool {
    if execution.is_cancelled() {
        return true;
    }
    if wait.is_zero() {
        return false;
    }

    let cancel = execution.cancel_signal();
    let (tx, rx) = tokio::sync::oneshot::channel();
    let task = scheduler.schedule(
        wait,
        Box::pin(async move {
            let _ = tx.send(());
        }),
    );

    tokio::select! {
        _ = cancel.cancelled() => {
            task.cancel();
            true
        }
        _ = rx => false,
    }
}

fn wrap<T, E>(
    executor: Arc<dyn PolicyExecutor<T, E>>,
    inner: StepFn<T, E>,
    scheduler: Arc<dyn Scheduler>,
) -> StepFn<T, E>
where
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    Arc::new(move |execution: &Execution<T, E>| -> BoxFuture<'_, ExecutionResult<T, E>> {
        let executor = executor.clone();
        let inner = inner.clone();
        let execution = execution.clone();
        let scheduler = scheduler.clone();
        Box::pin(async move { run_policy(executor, execution, inner, scheduler).await })
    })
}

fn base_step<T, E, Fut, Op>(op: Arc<Op>) -> StepFn<T, E>
where
    Op: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, ResilienceError<E>>> + Send + 'static,
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    Arc::new(move |execution: &Execution<T, E>| -> BoxFuture<'_, ExecutionResult<T, E>> {
        if execution.is_cancelled() {
            return Box::pin(async move { ExecutionResult::failure(ResilienceError::Cancelled) });
        }
        let op = op.clone();
        let attempt = execution.start_attempt();
        trace!(attempt, "starting execution attempt");
        Box::pin(async move {
            match op().await {
                Ok(value) => ExecutionResult::success(value),
                Err(failure) => ExecutionResult::failure(failure),
            }
        })
    })
}

/// Innermost step for the externally-signalled (out-of-band) completion
/// surface: `op` is a fire-and-forget runnable given a fresh
/// `AsyncExecution` for this attempt, expected to call `record(...)` itself
/// (synchronously or from a spawned task) rather than returning a future the
/// engine awaits directly (spec.md §4.10 shapes 2 & 3).
///
/// A retry re-enters this step, which builds a brand new `AsyncExecution`
/// per attempt, so a retried attempt genuinely re-invokes `op` rather than
/// replaying a stale recorded slot.
fn base_step_async<T, E, Op>(op: Arc<Op>) -> StepFn<T, E>
where
    Op: Fn(AsyncExecution<T, E>) + Send + Sync + 'static,
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    Arc::new(move |execution: &Execution<T, E>| -> BoxFuture<'_, ExecutionResult<T, E>> {
        if execution.is_cancelled() {
            return Box::pin(async move { ExecutionResult::failure(ResilienceError::Cancelled) });
        }
        let op = op.clone();
        let attempt = execution.start_attempt();
        trace!(attempt, "starting async execution attempt");
        let async_exec = AsyncExecution::new(execution.clone());
        Box::pin(async move {
            async_exec.mark_attempt_started();
            op(async_exec.clone());
            // `toExecutionAware`: a `record` made synchronously inside `op`
            // is already sitting in the slot by the time we poll it, so it
            // short-circuits straight to `Ready` without ever suspending.
            match async_exec.poll_recorded() {
                AttemptOutcome::Ready(result) => result,
                AttemptOutcome::Pending => match async_exec.wait_for_record().await {
                    Ok(value) => ExecutionResult::success(value),
                    Err(failure) => ExecutionResult::failure(failure),
                },
            }
        })
    })
}

/// An ordered, composed stack of resilience policies, outer-to-inner as
/// supplied to `ResilienceStackBuilder`.
///
/// Fixed to one result type `T` per instance: since each policy is stored
/// as `Arc<dyn PolicyExecutor<T, E>>`, a stack built for one operation's
/// result type cannot be reused for another. This mirrors how stacks are
/// used in practice — one composed stack per call site — and is documented
/// in DESIGN.md as a deliberate divergence from the teacher's
/// `ResilienceStack<E>` (whose fixed four fields carried no `T` at all).
pub struct ResilienceStack<T, E> {
    policies: Arc<Vec<Arc<dyn PolicyExecutor<T, E>>>>,
    scheduler: Arc<dyn Scheduler>,
}

impl<T, E> Clone for ResilienceStack<T, E> {
    fn clone(&self) -> Self {
        Self { policies: self.policies.clone(), scheduler: self.scheduler.clone() }
    }
}

impl<T, E> ResilienceStack<T, E>
where
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    /// Run `op` through the composed stack once, returning its final
    /// result. `op` must be re-invocable (`Fn`, not `FnOnce`/`FnMut`) since
    /// an inner retry policy may call it more than once per execution.
    pub async fn execute<Fut, Op>(&self, op: Op) -> Result<T, ResilienceError<E>>
    where
        Op: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ResilienceError<E>>> + Send + 'static,
    {
        let execution = Execution::new();
        let chain = self.build_chain(Arc::new(op));
        chain(&execution).await.into_result()
    }

    /// Run `op` through the composed stack, returning a `FailsafeFuture`
    /// immediately. The execution runs on a spawned task; cancelling the
    /// returned future requests cooperative cancellation of the whole
    /// execution (spec.md §4.11): no attempt already waiting out a retry
    /// delay resumes, and no new attempt starts.
    pub fn execute_async<Fut, Op>(&self, op: Op) -> FailsafeFuture<T, E>
    where
        Op: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ResilienceError<E>>> + Send + 'static,
        T: 'static,
        E: 'static,
    {
        let (future, handle) = pair::<T, E>();
        let execution = Execution::new();

        let execution_for_cancel = execution.clone();
        let handle_for_cancel = handle.clone();
        handle.register_cancel_fn(ORCHESTRATION_INDEX, move |_may_interrupt| {
            execution_for_cancel.cancel();
            let _ = handle_for_cancel;
        });

        let chain = self.build_chain(Arc::new(op));
        let spawn_handle = handle.clone();
        tokio::spawn(async move {
            let result = chain(&execution).await.into_result();
            spawn_handle.complete(result);
        });

        future
    }

    /// Run `op` through the composed stack using the externally-signalled
    /// completion surface (spec.md §4.10 shapes 2 & 3, §8 scenario 5): `op`
    /// receives a fresh `AsyncExecution` per attempt and is expected to call
    /// `record(...)` on it, in-line or from a task it spawns, rather than
    /// returning a future the engine awaits directly.
    pub fn run_async<Op>(&self, op: Op) -> FailsafeFuture<T, E>
    where
        Op: Fn(AsyncExecution<T, E>) + Send + Sync + 'static,
        T: 'static,
        E: 'static,
    {
        let (future, handle) = pair::<T, E>();
        let execution = Execution::new();

        let execution_for_cancel = execution.clone();
        let handle_for_cancel = handle.clone();
        handle.register_cancel_fn(ORCHESTRATION_INDEX, move |_may_interrupt| {
            execution_for_cancel.cancel();
            let _ = handle_for_cancel;
        });

        let chain = self.build_async_chain(Arc::new(op));
        let spawn_handle = handle.clone();
        tokio::spawn(async move {
            let result = chain(&execution).await.into_result();
            spawn_handle.complete(result);
        });

        future
    }

    fn build_chain<Fut, Op>(&self, op: Arc<Op>) -> StepFn<T, E>
    where
        Op: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ResilienceError<E>>> + Send + 'static,
    {
        let mut current = base_step(op);
        for executor in self.policies.iter().rev() {
            current = wrap(executor.clone(), current, self.scheduler.clone());
        }
        current
    }

    fn build_async_chain<Op>(&self, op: Arc<Op>) -> StepFn<T, E>
    where
        Op: Fn(AsyncExecution<T, E>) + Send + Sync + 'static,
    {
        let mut current = base_step_async(op);
        for executor in self.policies.iter().rev() {
            current = wrap(executor.clone(), current, self.scheduler.clone());
        }
        current
    }
}

/// Builds a `ResilienceStack` by appending policies in outer-to-inner
/// order. Each appended policy is held as a deferred factory rather than
/// constructed immediately, since its `policy_index` (spec.md §4.3: "0 is
/// innermost") can only be computed once the final policy count is known —
/// the first-appended (outermost) policy must receive the highest index,
/// the last-appended (innermost) index 0, the reverse of append order.
pub struct ResilienceStackBuilder<T, E> {
    factories: Vec<Box<dyn FnOnce(usize) -> Arc<dyn PolicyExecutor<T, E>> + Send>>,
    scheduler: Arc<dyn Scheduler>,
}

impl<T, E> Default for ResilienceStackBuilder<T, E> {
    fn default() -> Self {
        Self { factories: Vec::new(), scheduler: Arc::new(TokioScheduler) }
    }
}

impl<T, E> ResilienceStackBuilder<T, E>
where
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retry(mut self, policy: RetryPolicy<E>) -> Self {
        self.factories.push(Box::new(move |index| -> Arc<dyn PolicyExecutor<T, E>> {
            Arc::new(RetryExecutor::new(policy, index))
        }));
        self
    }

    pub fn circuit_breaker(
        self,
        failure_count: usize,
        recovery_timeout: Duration,
    ) -> Result<Self, CircuitBreakerConfigError> {
        let policy = CircuitBreakerPolicy::new(failure_count, recovery_timeout)?;
        Ok(self.circuit_breaker_policy(policy))
    }

    pub fn circuit_breaker_with_config(
        self,
        config: CircuitBreakerConfig,
    ) -> Result<Self, CircuitBreakerConfigError> {
        let policy = CircuitBreakerPolicy::with_config(config)?;
        Ok(self.circuit_breaker_policy(policy))
    }

    fn circuit_breaker_policy(mut self, policy: CircuitBreakerPolicy<E>) -> Self {
        self.factories.push(Box::new(move |index| -> Arc<dyn PolicyExecutor<T, E>> {
            Arc::new(CircuitBreakerExecutor::new(policy, index))
        }));
        self
    }

    pub fn timeout(mut self, duration: Duration) -> Result<Self, TimeoutConfigError> {
        let policy = TimeoutPolicy::new(duration)?;
        self.factories.push(Box::new(move |index| -> Arc<dyn PolicyExecutor<T, E>> {
            Arc::new(TimeoutExecutor::new(policy, index))
        }));
        Ok(self)
    }

    pub fn timeout_policy(mut self, policy: TimeoutPolicy) -> Self {
        self.factories.push(Box::new(move |index| -> Arc<dyn PolicyExecutor<T, E>> {
            Arc::new(TimeoutExecutor::new(policy, index))
        }));
        self
    }

    pub fn bulkhead(mut self, max_concurrent: usize) -> Self {
        self.factories.push(Box::new(move |index| -> Arc<dyn PolicyExecutor<T, E>> {
            Arc::new(BulkheadExecutor::new(BulkheadPolicy::new(max_concurrent), index))
        }));
        self
    }

    pub fn bulkhead_policy(mut self, policy: BulkheadPolicy) -> Self {
        self.factories.push(Box::new(move |index| -> Arc<dyn PolicyExecutor<T, E>> {
            Arc::new(BulkheadExecutor::new(policy, index))
        }));
        self
    }

    pub fn unlimited_bulkhead(mut self) -> Self {
        self.factories.push(Box::new(move |index| -> Arc<dyn PolicyExecutor<T, E>> {
            Arc::new(BulkheadExecutor::new(BulkheadPolicy::unlimited(), index))
        }));
        self
    }

    pub fn rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.factories.push(Box::new(move |index| -> Arc<dyn PolicyExecutor<T, E>> {
            Arc::new(RateLimiterExecutor::new(limiter, index))
        }));
        self
    }

    pub fn rate_limiter_with_telemetry(
        mut self,
        limiter: Arc<dyn RateLimiter>,
        emitter: crate::telemetry::Emitter,
    ) -> Self {
        self.factories.push(Box::new(move |index| -> Arc<dyn PolicyExecutor<T, E>> {
            Arc::new(RateLimiterExecutor::new(limiter, index).with_telemetry(emitter))
        }));
        self
    }

    pub fn fallback(mut self, policy: FallbackPolicy<T, E>) -> Self {
        self.factories.push(Box::new(move |index| -> Arc<dyn PolicyExecutor<T, E>> {
            Arc::new(FallbackExecutor::new(policy, index))
        }));
        self
    }

    /// Override the scheduler used to defer retry waits on the async path.
    /// Defaults to `TokioScheduler`; tests substitute a deterministic
    /// double here.
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn build(self) -> ResilienceStack<T, E> {
        let total = self.factories.len();
        let policies = self
            .factories
            .into_iter()
            .enumerate()
            .map(|(position, factory)| factory(total - 1 - position))
            .collect();
        ResilienceStack { policies: Arc::new(policies), scheduler: self.scheduler }
    }
}
