//! Timeout policy: bounds a single attempt's wall-clock duration.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant as TokioInstant;
use tracing::warn;

use crate::error::ResilienceError;
use crate::execution::Execution;
use crate::policy::{PolicyExecutor, StepFn};
use crate::result::ExecutionResult;
use crate::telemetry::{Emitter, PolicyEvent, TimeoutEvent};

/// The largest timeout a `TimeoutPolicy` accepts, guarding against
/// accidental near-infinite configuration (e.g. a duration meant to be
/// milliseconds supplied as nanoseconds).
pub const MAX_TIMEOUT: Duration = Duration::from_secs(30 * 24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeoutConfigError {
    ZeroDuration,
    ExceedsMaximum { requested: Duration, limit: Duration },
}

impl fmt::Display for TimeoutConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroDuration => write!(f, "timeout duration must be greater than zero"),
            Self::ExceedsMaximum { requested, limit } => {
                write!(f, "timeout {:?} exceeds maximum of {:?}", requested, limit)
            }
        }
    }
}

impl std::error::Error for TimeoutConfigError {}

/// Bounds a single attempt to `duration`. Does not retry by itself; an outer
/// retry policy sees a timed-out attempt as an ordinary failure.
#[derive(Clone)]
pub struct TimeoutPolicy {
    duration: Duration,
    with_interrupt: bool,
    emitter: Option<Emitter>,
}

impl fmt::Debug for TimeoutPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutPolicy")
            .field("duration", &self.duration)
            .field("with_interrupt", &self.with_interrupt)
            .finish()
    }
}

impl PartialEq for TimeoutPolicy {
    fn eq(&self, other: &Self) -> bool {
        self.duration == other.duration && self.with_interrupt == other.with_interrupt
    }
}

impl Eq for TimeoutPolicy {}

impl TimeoutPolicy {
    pub fn new(duration: Duration) -> Result<Self, TimeoutConfigError> {
        Self::new_with_max(duration, MAX_TIMEOUT)
    }

    pub fn new_with_max(duration: Duration, max: Duration) -> Result<Self, TimeoutConfigError> {
        if duration.is_zero() {
            return Err(TimeoutConfigError::ZeroDuration);
        }
        if duration > max {
            return Err(TimeoutConfigError::ExceedsMaximum { requested: duration, limit: max });
        }
        Ok(Self { duration, with_interrupt: false, emitter: None })
    }

    /// Request that, on fire, the running attempt's cancellation token is
    /// cancelled cooperatively (spec.md §4.6's `withInterrupt`, re-architected
    /// per REDESIGN FLAGS into `tokio_util::sync::CancellationToken` rather
    /// than an OS thread interrupt).
    pub fn with_interrupt(mut self) -> Self {
        self.with_interrupt = true;
        self
    }

    /// Emit a `PolicyEvent::Timeout` whenever the deadline fires.
    pub fn with_telemetry(mut self, emitter: Emitter) -> Self {
        self.emitter = Some(emitter);
        self
    }

    fn emit(&self, event: TimeoutEvent) {
        if let Some(emitter) = &self.emitter {
            emitter(PolicyEvent::Timeout(event));
        }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Run `op`, failing with `ResilienceError::Timeout` if it does not
    /// complete within `duration`.
    pub async fn execute<T, E, Fut, Op>(&self, op: Op) -> Result<T, ResilienceError<E>>
    where
        Op: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
    {
        let start = TokioInstant::now();
        match tokio::time::timeout(self.duration, op()).await {
            Ok(result) => result,
            Err(_elapsed) => {
                warn!(timeout = ?self.duration, "operation timed out");
                self.emit(TimeoutEvent::Occurred { timeout: self.duration });
                Err(ResilienceError::Timeout { elapsed: start.elapsed(), timeout: self.duration })
            }
        }
    }
}

/// Adapts `TimeoutPolicy` to the `PolicyExecutor` contract. Overrides
/// `invoke` (rather than just `pre_execute`/`on_failure`) because a timeout
/// must race the inner step against a deadline, not merely inspect its
/// result after the fact.
pub struct TimeoutExecutor {
    policy: TimeoutPolicy,
    policy_index: usize,
}

impl TimeoutExecutor {
    pub fn new(policy: TimeoutPolicy, policy_index: usize) -> Self {
        Self { policy, policy_index }
    }
}

#[async_trait]
impl<T, E> PolicyExecutor<T, E> for TimeoutExecutor
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
        // Timeouts are not retried by the timeout policy itself; an outer
        // retry policy classifies this as an ordinary failure.
        result
    }

    async fn invoke<'a>(
        &'a self,
        execution: &'a Execution<T, E>,
        inner: StepFn<T, E>,
    ) -> ExecutionResult<T, E> {
        let token = execution.cancellation_token();
        execution.begin_interruptible();
        let start = TokioInstant::now();

        let attempt = inner(execution);
        tokio::pin!(attempt);

        tokio::select! {
            result = &mut attempt => {
                let timed_out_anyway = execution.end_interruptible();
                if timed_out_anyway {
                    self.policy.emit(TimeoutEvent::Occurred { timeout: self.policy.duration });
                    ExecutionResult::failure(ResilienceError::Timeout {
                        elapsed: start.elapsed(),
                        timeout: self.policy.duration,
                    })
                } else {
                    result
                }
            }
            _ = tokio::time::sleep(self.policy.duration) => {
                warn!(timeout = ?self.policy.duration, "attempt exceeded timeout, firing watcher");
                self.policy.emit(TimeoutEvent::Occurred { timeout: self.policy.duration });
                let won_race = execution.request_interrupt(self.policy.with_interrupt);
                if won_race && self.policy.with_interrupt {
                    token.cancel();
                }
                // Let the attempt observe cancellation and unwind rather than
                // dropping it outright, so any cleanup it performs still runs.
                let _ = attempt.await;
                execution.end_interruptible();
                ExecutionResult::failure(ResilienceError::Timeout {
                    elapsed: start.elapsed(),
                    timeout: self.policy.duration,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[tokio::test]
    async fn succeeds_within_deadline() {
        let policy = TimeoutPolicy::new(Duration::from_millis(50)).unwrap();
        let result: Result<i32, ResilienceError<io::Error>> =
            policy.execute(|| async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn fires_on_slow_operation() {
        let policy = TimeoutPolicy::new(Duration::from_millis(10)).unwrap();
        let handle = tokio::spawn(async move {
            policy
                .execute(|| async {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok::<_, ResilienceError<io::Error>>(())
                })
                .await
        });
        tokio::time::advance(Duration::from_millis(20)).await;
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(e) if e.is_timeout()));
    }

    #[test]
    fn zero_duration_rejected() {
        assert_eq!(TimeoutPolicy::new(Duration::ZERO), Err(TimeoutConfigError::ZeroDuration));
    }

    #[test]
    fn exceeding_max_rejected() {
        let result = TimeoutPolicy::new_with_max(Duration::from_secs(10), Duration::from_secs(5));
        assert!(matches!(result, Err(TimeoutConfigError::ExceedsMaximum { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn telemetry_emits_on_fire() {
        use crate::telemetry::PolicyEvent;
        use std::sync::{Arc, Mutex as StdMutex};

        let events: Arc<StdMutex<Vec<PolicyEvent>>> = Arc::new(StdMutex::new(Vec::new()));
        let events_clone = events.clone();
        let policy = TimeoutPolicy::new(Duration::from_millis(10))
            .unwrap()
            .with_telemetry(Arc::new(move |event| events_clone.lock().unwrap().push(event)));

        let handle = tokio::spawn(async move {
            policy
                .execute(|| async {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok::<_, ResilienceError<io::Error>>(())
                })
                .await
        });
        tokio::time::advance(Duration::from_millis(20)).await;
        let _ = handle.await.unwrap();
        assert!(matches!(
            events.lock().unwrap().as_slice(),
            [PolicyEvent::Timeout(TimeoutEvent::Occurred { .. })]
        ));
    }
}
