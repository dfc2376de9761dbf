//! Circuit breaker: CLOSED / OPEN / HALF_OPEN state machine over a sliding
//! window of recent outcomes.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::clock::{Clock, MonotonicClock};
use crate::error::ResilienceError;
use crate::execution::Execution;
use crate::policy::PolicyExecutor;
use crate::result::ExecutionResult;
use crate::telemetry::{CircuitBreakerEvent, Emitter, PolicyEvent};

/// Errors building an invalid `CircuitBreakerConfig`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitBreakerConfigError {
    InvalidThreshold,
    ThresholdExceedsWindow,
}

impl fmt::Display for CircuitBreakerConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidThreshold => write!(f, "threshold counts must be greater than zero"),
            Self::ThresholdExceedsWindow => {
                write!(f, "threshold's m must not exceed its window n")
            }
        }
    }
}

impl std::error::Error for CircuitBreakerConfigError {}

/// An "m of n" ratio: `m` qualifying outcomes within the most recent `n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Threshold {
    pub m: usize,
    pub n: usize,
}

impl Threshold {
    pub fn new(m: usize, n: usize) -> Result<Self, CircuitBreakerConfigError> {
        if m == 0 || n == 0 {
            return Err(CircuitBreakerConfigError::InvalidThreshold);
        }
        if m > n {
            return Err(CircuitBreakerConfigError::ThresholdExceedsWindow);
        }
        Ok(Self { m, n })
    }

    /// A count-based threshold with no sliding window: `n == m`, i.e. every
    /// outcome in the window must qualify. This is the teacher's original
    /// "consecutive failures" semantics, expressed as the `m == n` corner
    /// case of the more general ratio window (spec.md §9 open question).
    pub fn consecutive(count: usize) -> Result<Self, CircuitBreakerConfigError> {
        Self::new(count, count)
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: Threshold,
    pub success_threshold: Threshold,
    pub delay: Duration,
}

impl CircuitBreakerConfig {
    pub fn new(
        failure_threshold: Threshold,
        success_threshold: Threshold,
        delay: Duration,
    ) -> Self {
        Self { failure_threshold, success_threshold, delay }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Fixed-capacity ring buffer of recent boolean outcomes (`true` = success).
#[derive(Debug, Clone)]
struct Window {
    buffer: Vec<bool>,
    pos: usize,
    filled: usize,
}

impl Window {
    fn new(capacity: usize) -> Self {
        Self { buffer: vec![false; capacity.max(1)], pos: 0, filled: 0 }
    }

    fn record(&mut self, success: bool) {
        let cap = self.buffer.len();
        self.buffer[self.pos] = success;
        self.pos = (self.pos + 1) % cap;
        self.filled = (self.filled + 1).min(cap);
    }

    fn failures(&self) -> usize {
        self.buffer[..self.filled].iter().filter(|s| !**s).count()
    }

    fn successes(&self) -> usize {
        self.filled - self.failures()
    }

    fn len(&self) -> usize {
        self.filled
    }
}

struct StateInner {
    state: CircuitState,
    window: Window,
    opened_at_millis: u64,
    half_open_permits_issued: usize,
}

/// Shared, thread-safe circuit breaker state. A ring-buffer window backs
/// both the `CLOSED` failure count and the `HALF_OPEN` trial count; a single
/// `Mutex` guards it. Pure lock-free atomics (the teacher's original
/// consecutive-counter design) cannot express a ring buffer race-free, so
/// this trades the teacher's CAS loop for a narrow mutex around the window
/// — documented in DESIGN.md.
pub struct CircuitBreakerState {
    inner: Mutex<StateInner>,
}

impl fmt::Debug for CircuitBreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("CircuitBreakerState").field("state", &inner.state).finish()
    }
}

impl CircuitBreakerState {
    fn new(failure_window: usize) -> Self {
        Self {
            inner: Mutex::new(StateInner {
                state: CircuitState::Closed,
                window: Window::new(failure_window),
                opened_at_millis: 0,
                half_open_permits_issued: 0,
            }),
        }
    }

    pub fn current_state(&self) -> CircuitState {
        self.inner.lock().unwrap().state
    }

    pub fn reset(&self, failure_window: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = CircuitState::Closed;
        inner.window = Window::new(failure_window);
        inner.half_open_permits_issued = 0;
    }
}

enum Admission {
    Allowed,
    Rejected { failure_count: usize, open_duration: Duration },
}

/// Configuration, classifiers, and shared state machine for a single
/// circuit breaker instance. Cheaply cloneable: the state is `Arc`-shared so
/// every composed execution observes the same breaker.
pub struct CircuitBreakerPolicy<E> {
    state: Arc<CircuitBreakerState>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    is_failure: Arc<dyn Fn(&ResilienceError<E>) -> bool + Send + Sync>,
    emitter: Option<Emitter>,
}

impl<E> Clone for CircuitBreakerPolicy<E> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            config: self.config.clone(),
            clock: self.clock.clone(),
            is_failure: self.is_failure.clone(),
            emitter: self.emitter.clone(),
        }
    }
}

impl<E> fmt::Debug for CircuitBreakerPolicy<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerPolicy")
            .field("config", &self.config)
            .field("state", &self.state.current_state())
            .finish()
    }
}

impl<E> CircuitBreakerPolicy<E> {
    /// A breaker that opens after `failure_count` consecutive failures
    /// (count-based window) and waits `recovery_timeout` before trialing a
    /// single request in `HALF_OPEN`.
    pub fn new(
        failure_count: usize,
        recovery_timeout: Duration,
    ) -> Result<Self, CircuitBreakerConfigError> {
        let failure_threshold = Threshold::consecutive(failure_count)?;
        let success_threshold = Threshold::consecutive(1)?;
        Self::with_config(CircuitBreakerConfig::new(
            failure_threshold,
            success_threshold,
            recovery_timeout,
        ))
    }

    pub fn with_config(config: CircuitBreakerConfig) -> Result<Self, CircuitBreakerConfigError> {
        Ok(Self {
            state: Arc::new(CircuitBreakerState::new(config.failure_threshold.n)),
            config,
            clock: Arc::new(MonotonicClock::default()),
            is_failure: Arc::new(|e| e.is_classifiable()),
            emitter: None,
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_failure_classifier<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&ResilienceError<E>) -> bool + Send + Sync + 'static,
    {
        self.is_failure = Arc::new(predicate);
        self
    }

    /// Emit a `PolicyEvent::CircuitBreaker` on every open/half-open/closed
    /// transition, in addition to the `tracing` lines already logged.
    pub fn with_telemetry(mut self, emitter: Emitter) -> Self {
        self.emitter = Some(emitter);
        self
    }

    fn emit(&self, event: CircuitBreakerEvent) {
        if let Some(emitter) = &self.emitter {
            emitter(PolicyEvent::CircuitBreaker(event));
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state.current_state()
    }

    fn admit(&self) -> Admission {
        let now = self.clock.now_millis();
        let mut inner = self.state.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::Open => {
                let elapsed_millis = now.saturating_sub(inner.opened_at_millis);
                if elapsed_millis >= self.config.delay.as_millis() as u64 {
                    info!("circuit breaker transitioning open -> half_open");
                    inner.state = CircuitState::HalfOpen;
                    inner.window = Window::new(self.config.success_threshold.n);
                    inner.half_open_permits_issued = 1;
                    self.emit(CircuitBreakerEvent::HalfOpen);
                    Admission::Allowed
                } else {
                    Admission::Rejected {
                        failure_count: inner.window.failures(),
                        open_duration: Duration::from_millis(elapsed_millis),
                    }
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_permits_issued < self.config.success_threshold.n {
                    inner.half_open_permits_issued += 1;
                    Admission::Allowed
                } else {
                    Admission::Rejected {
                        failure_count: inner.window.failures(),
                        open_duration: Duration::from_millis(
                            now.saturating_sub(inner.opened_at_millis),
                        ),
                    }
                }
            }
        }
    }

    fn record(&self, success: bool) {
        let now = self.clock.now_millis();
        let mut inner = self.state.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed => {
                inner.window.record(success);
                if inner.window.len() >= self.config.failure_threshold.n
                    && inner.window.failures() >= self.config.failure_threshold.m
                {
                    warn!(failures = inner.window.failures(), "circuit breaker opening");
                    let failure_count = inner.window.failures();
                    inner.state = CircuitState::Open;
                    inner.opened_at_millis = now;
                    inner.window = Window::new(self.config.failure_threshold.n);
                    self.emit(CircuitBreakerEvent::Opened { failure_count });
                }
            }
            CircuitState::HalfOpen => {
                inner.window.record(success);
                let st = self.config.success_threshold;
                if inner.window.successes() >= st.m {
                    info!("circuit breaker closing after successful trial period");
                    inner.state = CircuitState::Closed;
                    inner.window = Window::new(self.config.failure_threshold.n);
                    inner.half_open_permits_issued = 0;
                    self.emit(CircuitBreakerEvent::Closed);
                } else if inner.window.failures() > st.n - st.m {
                    warn!("circuit breaker re-opening after failed trial");
                    let failure_count = inner.window.failures();
                    inner.state = CircuitState::Open;
                    inner.opened_at_millis = now;
                    inner.window = Window::new(self.config.failure_threshold.n);
                    inner.half_open_permits_issued = 0;
                    self.emit(CircuitBreakerEvent::Opened { failure_count });
                }
            }
            CircuitState::Open => {
                debug!("outcome recorded while circuit breaker open, ignoring");
            }
        }
    }

    /// Run `op` guarded by the breaker: rejects immediately with
    /// `ResilienceError::CircuitOpen` while open; otherwise runs `op` once
    /// and records its outcome. The breaker neither retries nor falls back
    /// by itself (spec.md §4.5).
    pub async fn execute<T, Fut, Op>(&self, op: Op) -> Result<T, ResilienceError<E>>
    where
        Op: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
    {
        match self.admit() {
            Admission::Rejected { failure_count, open_duration } => {
                return Err(ResilienceError::CircuitOpen { failure_count, open_duration });
            }
            Admission::Allowed => {}
        }

        match op().await {
            Ok(value) => {
                self.record(true);
                Ok(value)
            }
            Err(err) => {
                let counts_as_failure = (self.is_failure)(&err);
                self.record(!counts_as_failure);
                Err(err)
            }
        }
    }
}

/// Adapts `CircuitBreakerPolicy` to the `PolicyExecutor` contract.
pub struct CircuitBreakerExecutor<E> {
    policy: CircuitBreakerPolicy<E>,
    policy_index: usize,
}

impl<E> CircuitBreakerExecutor<E> {
    pub fn new(policy: CircuitBreakerPolicy<E>, policy_index: usize) -> Self {
        Self { policy, policy_index }
    }
}

#[async_trait]
impl<T, E> PolicyExecutor<T, E> for CircuitBreakerExecutor<E>
where
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    fn policy_index(&self) -> usize {
        self.policy_index
    }

    async fn pre_execute(&self, _execution: &Execution<T, E>) -> Option<ExecutionResult<T, E>> {
        match self.policy.admit() {
            Admission::Allowed => None,
            Admission::Rejected { failure_count, open_duration } => Some(
                ExecutionResult::failure(ResilienceError::CircuitOpen {
                    failure_count,
                    open_duration,
                })
                .with_complete(),
            ),
        }
    }

    fn classify(&self, result: &ExecutionResult<T, E>) -> bool {
        result.failure_ref().is_some_and(|e| (self.policy.is_failure)(e))
    }

    fn on_success(&self, _execution: &Execution<T, E>, _result: &ExecutionResult<T, E>) {
        self.policy.record(true);
    }

    async fn on_failure(
        &self,
        _execution: &Execution<T, E>,
        result: ExecutionResult<T, E>,
    ) -> ExecutionResult<T, E> {
        self.policy.record(false);
        result
    }
}

#[derive(Debug, Default)]
struct ManualClock {
    millis: std::sync::atomic::AtomicU64,
}

impl ManualClock {
    fn advance(&self, millis: u64) {
        self.millis.fetch_add(millis, std::sync::atomic::Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.millis.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    type Err = ResilienceError<io::Error>;

    fn boom() -> io::Error {
        io::Error::new(io::ErrorKind::Other, "boom")
    }

    #[tokio::test]
    async fn opens_after_consecutive_failures() {
        let cb: CircuitBreakerPolicy<io::Error> =
            CircuitBreakerPolicy::new(2, Duration::from_secs(30)).unwrap();

        let _ = cb.execute(|| async { Err::<(), Err>(ResilienceError::Inner(boom())) }).await;
        assert_eq!(cb.state(), CircuitState::Closed);

        let _ = cb.execute(|| async { Err::<(), Err>(ResilienceError::Inner(boom())) }).await;
        assert_eq!(cb.state(), CircuitState::Open);

        let result = cb.execute(|| async { Ok::<_, Err>(()) }).await;
        assert!(matches!(result, Err(e) if e.is_circuit_open()));
    }

    #[tokio::test]
    async fn transitions_to_half_open_after_delay() {
        let clock = Arc::new(ManualClock::default());
        let cb: CircuitBreakerPolicy<io::Error> =
            CircuitBreakerPolicy::new(1, Duration::from_millis(100))
                .unwrap()
                .with_clock(clock.clone());

        let _ = cb.execute(|| async { Err::<(), Err>(ResilienceError::Inner(boom())) }).await;
        assert_eq!(cb.state(), CircuitState::Open);

        clock.advance(150);
        let result = cb.execute(|| async { Ok::<_, Err>(()) }).await;
        assert!(result.is_ok());
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_reopens_on_failed_trial() {
        let clock = Arc::new(ManualClock::default());
        let cb: CircuitBreakerPolicy<io::Error> =
            CircuitBreakerPolicy::new(1, Duration::from_millis(100))
                .unwrap()
                .with_clock(clock.clone());

        let _ = cb.execute(|| async { Err::<(), Err>(ResilienceError::Inner(boom())) }).await;
        clock.advance(150);

        let result = cb.execute(|| async { Err::<(), Err>(ResilienceError::Inner(boom())) }).await;
        assert!(result.is_err());
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn threshold_rejects_m_greater_than_n() {
        assert_eq!(Threshold::new(3, 2), Err(CircuitBreakerConfigError::ThresholdExceedsWindow));
    }

    #[tokio::test]
    async fn telemetry_emits_on_open() {
        use crate::telemetry::PolicyEvent;
        use std::sync::Mutex as StdMutex;

        let events: Arc<StdMutex<Vec<PolicyEvent>>> = Arc::new(StdMutex::new(Vec::new()));
        let events_clone = events.clone();
        let cb: CircuitBreakerPolicy<io::Error> =
            CircuitBreakerPolicy::new(1, Duration::from_secs(30))
                .unwrap()
                .with_telemetry(Arc::new(move |event| events_clone.lock().unwrap().push(event)));

        let _ = cb.execute(|| async { Err::<(), Err>(ResilienceError::Inner(boom())) }).await;
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(matches!(
            events.lock().unwrap().as_slice(),
            [PolicyEvent::CircuitBreaker(CircuitBreakerEvent::Opened { .. })]
        ));
    }

    #[tokio::test]
    async fn windowed_threshold_tolerates_sparse_failures() {
        let cb: CircuitBreakerPolicy<io::Error> = CircuitBreakerPolicy::with_config(
            CircuitBreakerConfig::new(
                Threshold::new(3, 5).unwrap(),
                Threshold::new(1, 1).unwrap(),
                Duration::from_secs(30),
            ),
        )
        .unwrap();

        for _ in 0..2 {
            let _ = cb.execute(|| async { Err::<(), Err>(ResilienceError::Inner(boom())) }).await;
        }
        let _ = cb.execute(|| async { Ok::<_, Err>(()) }).await;
        assert_eq!(cb.state(), CircuitState::Closed);

        for _ in 0..3 {
            let _ = cb.execute(|| async { Err::<(), Err>(ResilienceError::Inner(boom())) }).await;
        }
        assert_eq!(cb.state(), CircuitState::Open);
    }
}
