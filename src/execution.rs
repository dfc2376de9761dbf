//! Per-call mutable execution context.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::ResilienceError;
use crate::result::{AttemptOutcome, ExecutionResult};

/// Mutex-protected `{canInterrupt, interrupted}` pair guarding the race
/// between a completing attempt and a firing timeout watcher.
#[derive(Debug, Default, Clone, Copy)]
pub struct InterruptState {
    can_interrupt: bool,
    interrupted: bool,
}

impl InterruptState {
    pub fn interrupted(&self) -> bool {
        self.interrupted
    }
}

/// Budget and classifiers backing the manual `Execution` orchestration
/// surface (`record_failure` / `record_result` / `can_retry_for`), mirroring
/// a subset of `RetryPolicy`'s own decision so callers who drive `Execution`
/// by hand (instead of going through a `ResilienceStack`) still get retry
/// semantics.
pub struct RetryBudget<T, E> {
    pub max_attempts: Option<usize>,
    pub max_duration: Option<Duration>,
    pub should_retry: Arc<dyn Fn(Option<&T>, Option<&ResilienceError<E>>) -> bool + Send + Sync>,
}

impl<T, E> Clone for RetryBudget<T, E> {
    fn clone(&self) -> Self {
        Self {
            max_attempts: self.max_attempts,
            max_duration: self.max_duration,
            should_retry: self.should_retry.clone(),
        }
    }
}

struct ExecutionInner<T, E> {
    attempt: AtomicUsize,
    start: Instant,
    last_attempt_start: Mutex<Instant>,
    interrupt_state: Mutex<InterruptState>,
    completed: AtomicBool,
    /// Per-attempt interrupt signal: fired only by a racing timeout watcher
    /// (`request_interrupt`) to stop the operation thread/task currently
    /// running. Distinct from `cancel_token` below.
    cancellation: CancellationToken,
    /// Whole-execution cancellation signal: fired only by the outer
    /// `FailsafeFuture::cancel` (spec.md §4.11, §5). Once set, the retry
    /// loop stops re-entering the inner function and no further attempt
    /// runs, regardless of any in-progress timeout interrupt.
    cancel_token: CancellationToken,
    retry_budget: Option<RetryBudget<T, E>>,
}

/// Per-call mutable context threaded through a composed policy stack.
///
/// Cheaply cloneable: internally `Arc`-wrapped, matching the shared-state
/// idiom the rest of the crate uses for policy state (`CircuitBreakerState`,
/// `BulkheadPolicy`'s semaphore) so the same context can be captured by every
/// layer of the folded composition closure.
pub struct Execution<T, E> {
    inner: Arc<ExecutionInner<T, E>>,
}

impl<T, E> Clone for Execution<T, E> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T, E> fmt::Debug for Execution<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Execution")
            .field("attempt", &self.attempts())
            .field("completed", &self.is_complete())
            .finish()
    }
}

impl<T, E> Execution<T, E> {
    /// Create a fresh execution context with no retry budget attached.
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            inner: Arc::new(ExecutionInner {
                attempt: AtomicUsize::new(0),
                start: now,
                last_attempt_start: Mutex::new(now),
                interrupt_state: Mutex::new(InterruptState::default()),
                completed: AtomicBool::new(false),
                cancellation: CancellationToken::new(),
                cancel_token: CancellationToken::new(),
                retry_budget: None,
            }),
        }
    }

    /// Attach a retry budget used by the manual orchestration surface.
    pub fn with_retry_budget(budget: RetryBudget<T, E>) -> Self {
        let now = Instant::now();
        Self {
            inner: Arc::new(ExecutionInner {
                attempt: AtomicUsize::new(0),
                start: now,
                last_attempt_start: Mutex::new(now),
                interrupt_state: Mutex::new(InterruptState::default()),
                completed: AtomicBool::new(false),
                cancellation: CancellationToken::new(),
                cancel_token: CancellationToken::new(),
                retry_budget: Some(budget),
            }),
        }
    }

    /// Mark the start of a new attempt; returns the 1-indexed attempt number.
    pub fn start_attempt(&self) -> usize {
        *self.inner.last_attempt_start.lock().unwrap() = Instant::now();
        self.inner.attempt.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Number of attempts started so far.
    pub fn attempts(&self) -> usize {
        self.inner.attempt.load(Ordering::Acquire)
    }

    /// Wall-clock time since the execution began.
    pub fn elapsed(&self) -> Duration {
        self.inner.start.elapsed()
    }

    /// Wall-clock time since the current attempt started.
    pub fn last_attempt_elapsed(&self) -> Duration {
        self.inner.last_attempt_start.lock().unwrap().elapsed()
    }

    /// Cooperative cancellation token for the attempt currently in flight.
    /// The timeout policy fires this to request the operation stop; the
    /// operation wrapper observes it without any OS-level thread interrupt.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancellation.clone()
    }

    /// Called by the attempt wrapper when the user operation begins running:
    /// arms `can_interrupt` so a racing timeout watcher is permitted to act.
    pub fn begin_interruptible(&self) {
        let mut state = self.inner.interrupt_state.lock().unwrap();
        state.can_interrupt = true;
    }

    /// Called by the attempt wrapper when the user operation finishes.
    /// Returns `true` if a timeout already marked this attempt interrupted —
    /// the caller should report `ResilienceError::Timeout` rather than its
    /// own result, and must not leak any cancellation signal further.
    pub fn end_interruptible(&self) -> bool {
        let mut state = self.inner.interrupt_state.lock().unwrap();
        state.can_interrupt = false;
        std::mem::take(&mut state.interrupted)
    }

    /// Called by the timeout watcher on fire. Returns `true` if it won the
    /// race (the attempt was still interruptible) and should request
    /// cancellation; `false` if the attempt had already completed.
    pub fn request_interrupt(&self, with_interrupt: bool) -> bool {
        let mut state = self.inner.interrupt_state.lock().unwrap();
        if !state.can_interrupt {
            return false;
        }
        if with_interrupt {
            state.interrupted = true;
            self.inner.cancellation.cancel();
        }
        true
    }

    /// Request cancellation of the whole execution, not just the attempt
    /// currently in flight. Called only by the orchestration layer in
    /// response to `FailsafeFuture::cancel` (spec.md §4.11).
    pub fn cancel(&self) {
        self.inner.cancel_token.cancel();
    }

    /// Has the whole execution been cancelled? Checked by the composition
    /// engine before starting a new attempt and before re-entering the
    /// inner function after a retry wait, so no attempt runs once the
    /// outer `FailsafeFuture` has been cancelled (spec.md §5, §8 scenario 6).
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel_token.is_cancelled()
    }

    /// A clone of the whole-execution cancellation token, for racing a
    /// retry-delay sleep against cancellation in a `select!`.
    pub fn cancel_signal(&self) -> CancellationToken {
        self.inner.cancel_token.clone()
    }

    pub fn is_complete(&self) -> bool {
        self.inner.completed.load(Ordering::Acquire)
    }

    pub fn mark_complete(&self) {
        self.inner.completed.store(true, Ordering::Release);
    }

    /// Manual orchestration: would the attached retry budget permit another
    /// attempt given this outcome? Always `false` with no budget attached.
    pub fn can_retry_for(&self, value: Option<&T>, failure: Option<&ResilienceError<E>>) -> bool {
        let Some(budget) = &self.inner.retry_budget else {
            return false;
        };
        if let Some(max) = budget.max_attempts {
            if self.attempts() >= max {
                return false;
            }
        }
        if let Some(max_duration) = budget.max_duration {
            if self.elapsed() >= max_duration {
                return false;
            }
        }
        (budget.should_retry)(value, failure)
    }

    /// Manual orchestration: record a failure and report whether the
    /// execution is now complete.
    pub fn record_failure(&self, failure: ResilienceError<E>) -> bool
    where
        T: 'static,
    {
        if !self.can_retry_for(None, Some(&failure)) {
            self.mark_complete();
        }
        self.is_complete()
    }

    /// Manual orchestration: record a successful result and report whether
    /// the execution is now complete.
    pub fn record_result(&self, value: &T) -> bool {
        if !self.can_retry_for(Some(value), None) {
            self.mark_complete();
        }
        self.is_complete()
    }
}

impl<T, E> Default for Execution<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Extends `Execution` with the handle needed for externally-signalled
/// (out-of-band) completion: the user's async operation calls `record(...)`
/// itself rather than returning a future the engine awaits directly.
pub struct AsyncExecution<T, E> {
    execution: Execution<T, E>,
    attempt_started: Arc<AtomicBool>,
    recorded: Arc<Mutex<Option<Result<T, ResilienceError<E>>>>>,
    notify: Arc<Notify>,
}

impl<T, E> Clone for AsyncExecution<T, E> {
    fn clone(&self) -> Self {
        Self {
            execution: self.execution.clone(),
            attempt_started: self.attempt_started.clone(),
            recorded: self.recorded.clone(),
            notify: self.notify.clone(),
        }
    }
}

impl<T, E> AsyncExecution<T, E> {
    pub fn new(execution: Execution<T, E>) -> Self {
        Self {
            execution,
            attempt_started: Arc::new(AtomicBool::new(false)),
            recorded: Arc::new(Mutex::new(None)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn execution(&self) -> &Execution<T, E> {
        &self.execution
    }

    pub fn mark_attempt_started(&self) {
        self.attempt_started.store(true, Ordering::Release);
    }

    pub fn attempt_started(&self) -> bool {
        self.attempt_started.load(Ordering::Acquire)
    }

    /// Record an out-of-band result. Only the first call transitions state;
    /// later calls for the same attempt are silently dropped, matching the
    /// idempotent-`record` invariant (spec.md §3, §5).
    ///
    /// Returns `true` if this call was the one that recorded the result.
    pub fn record(&self, value: Option<T>, failure: Option<ResilienceError<E>>) -> bool {
        let mut slot = self.recorded.lock().unwrap();
        if slot.is_some() {
            return false;
        }
        *slot = Some(match (value, failure) {
            (Some(v), _) => Ok(v),
            (None, Some(f)) => Err(f),
            (None, None) => Err(ResilienceError::Cancelled),
        });
        drop(slot);
        self.notify.notify_waiters();
        true
    }

    pub fn is_recorded(&self) -> bool {
        self.recorded.lock().unwrap().is_some()
    }

    /// Take the recorded out-of-band result, if any has arrived, leaving the
    /// slot empty — a fresh retry attempt reuses the same `AsyncExecution`
    /// and may record again.
    pub fn take_recorded(&self) -> Option<Result<T, ResilienceError<E>>> {
        self.recorded.lock().unwrap().take()
    }

    /// `toExecutionAware`: check whether a result has already arrived
    /// out-of-band without blocking. `AttemptOutcome::Pending` is the
    /// spec's `NULL_FUTURE` sentinel — the caller must await
    /// `wait_for_record` to learn the eventual result (spec.md §3, §4.10).
    pub fn poll_recorded(&self) -> AttemptOutcome<T, E> {
        match self.take_recorded() {
            Some(Ok(value)) => AttemptOutcome::Ready(ExecutionResult::success(value)),
            Some(Err(failure)) => AttemptOutcome::Ready(ExecutionResult::failure(failure)),
            None => AttemptOutcome::Pending,
        }
    }

    /// Suspend until the user operation calls `record(...)`, returning the
    /// out-of-band result. Used by the composition engine's async-runnable
    /// attempt wrapper (spec.md §4.10 shape 2) once `poll_recorded` reports
    /// `Pending`.
    pub async fn wait_for_record(&self) -> Result<T, ResilienceError<E>> {
        loop {
            if let Some(result) = self.take_recorded() {
                return result;
            }
            self.notify.notified().await;
        }
    }
}
