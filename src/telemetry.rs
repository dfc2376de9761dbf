//! Structured policy events, trimmed from the teacher's `telemetry/events.rs`
//! + `telemetry/sinks.rs` down to what spec.md's components actually need:
//! `PolicyEvent`, `TelemetrySink` as a `tower::Service<PolicyEvent>`, and
//! `NullSink` / `LogSink` / `MemorySink`. The teacher's streaming, non-blocking,
//! multicast, and fallback sinks are dropped along with the JSON encoding
//! feature (no distributed fan-out or wire format, per SPEC_FULL.md's
//! ambient-stack scope) — callers who want those can layer them externally
//! against the same `tower::Service<PolicyEvent>` contract.

use std::convert::Infallible;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use tower::Service;

/// Structured events emitted by policies during execution.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyEvent {
    Retry(RetryEvent),
    CircuitBreaker(CircuitBreakerEvent),
    Bulkhead(BulkheadEvent),
    Timeout(TimeoutEvent),
    RateLimit(RateLimitEvent),
    Request(RequestOutcome),
}

/// Events emitted by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryEvent {
    /// A retry is about to be attempted, after `delay`.
    Attempt { attempt: usize, delay: Duration },
    /// The retry budget (attempt count or wall clock) has been exhausted.
    Exhausted { total_attempts: usize, total_duration: Duration },
}

/// Events emitted by the circuit breaker policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitBreakerEvent {
    Opened { failure_count: usize },
    HalfOpen,
    Closed,
}

/// Events emitted by the bulkhead policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkheadEvent {
    Acquired { active_count: usize, max_concurrency: usize },
    Rejected { active_count: usize, max_concurrency: usize },
}

/// Events emitted by the timeout policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutEvent {
    Occurred { timeout: Duration },
}

/// Events emitted by rate limiter strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitEvent {
    Denied { wait: Duration },
}

/// Request outcome, emitted by the orchestration layer regardless of which
/// policies are composed into the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    Success { duration: Duration },
    Failure { duration: Duration },
}

impl fmt::Display for PolicyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Retry(event) => write!(f, "Retry::{event}"),
            Self::CircuitBreaker(event) => write!(f, "CircuitBreaker::{event}"),
            Self::Bulkhead(event) => write!(f, "Bulkhead::{event}"),
            Self::Timeout(event) => write!(f, "Timeout::{event}"),
            Self::RateLimit(event) => write!(f, "RateLimit::{event}"),
            Self::Request(event) => write!(f, "Request::{event}"),
        }
    }
}

impl fmt::Display for RetryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Attempt { attempt, delay } => write!(f, "Attempt(#{attempt}, delay={delay:?})"),
            Self::Exhausted { total_attempts, total_duration } => {
                write!(f, "Exhausted(attempts={total_attempts}, duration={total_duration:?})")
            }
        }
    }
}

impl fmt::Display for CircuitBreakerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Opened { failure_count } => write!(f, "Opened(failures={failure_count})"),
            Self::HalfOpen => write!(f, "HalfOpen"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

impl fmt::Display for BulkheadEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Acquired { active_count, max_concurrency } => {
                write!(f, "Acquired({active_count}/{max_concurrency})")
            }
            Self::Rejected { active_count, max_concurrency } => {
                write!(f, "Rejected({active_count}/{max_concurrency})")
            }
        }
    }
}

impl fmt::Display for TimeoutEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Occurred { timeout } => write!(f, "Occurred(timeout={timeout:?})"),
        }
    }
}

impl fmt::Display for RateLimitEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Denied { wait } => write!(f, "Denied(wait={wait:?})"),
        }
    }
}

impl fmt::Display for RequestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success { duration } => write!(f, "Success(duration={duration:?})"),
            Self::Failure { duration } => write!(f, "Failure(duration={duration:?})"),
        }
    }
}

/// A telemetry sink that consumes `PolicyEvent`s, modeled as a `tower::Service`
/// so sinks compose with the rest of the tower ecosystem (buffering, retrying
/// the sink itself, etc.) without this crate needing to reinvent any of that.
pub trait TelemetrySink:
    tower::Service<PolicyEvent, Response = (), Error = Self::SinkError> + Clone + Send + 'static
{
    type SinkError: std::error::Error + Send + 'static;
}

/// Best-effort emit: await readiness, send the event, swallow any error.
/// Policies call this fire-and-forget so a misbehaving sink can never affect
/// the outcome of the guarded operation.
pub async fn emit_best_effort<S>(sink: S, event: PolicyEvent)
where
    S: tower::Service<PolicyEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    use tower::ServiceExt;

    if let Ok(mut ready_sink) = sink.ready_oneshot().await {
        let _ = ready_sink.call(event).await;
    }
}

/// Discards every event. The default sink when telemetry isn't configured.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<PolicyEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: PolicyEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// Logs every event via `tracing::info!` at the `policy_event` target.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<PolicyEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: PolicyEvent) -> Self::Future {
        tracing::info!(event = %event, "policy_event");
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

/// Retains the last `capacity` events in memory, evicting the oldest first.
/// Intended for tests and local debugging, not long-running production use.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<PolicyEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn events(&self) -> Vec<PolicyEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().unwrap().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<PolicyEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: PolicyEvent) -> Self::Future {
        let mut guard = self.events.lock().unwrap();
        if guard.len() >= self.capacity {
            guard.remove(0);
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push(event);
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}

/// Type-erased emit callback threaded into policies that support telemetry.
/// Policies hold `Option<Emitter>` rather than a generic `TelemetrySink`
/// parameter, since `PolicyExecutor`'s synchronous hooks (`on_success`,
/// `pre_execute`) can't easily carry a `tower::Service`'s `&mut self` + poll
/// contract; `emitter_from_sink` bridges the two by spawning the best-effort
/// send so emission never blocks the guarded call.
pub type Emitter = Arc<dyn Fn(PolicyEvent) + Send + Sync>;

/// Wrap any `TelemetrySink` as an `Emitter`, dispatching each event on its own
/// spawned task so a slow or blocked sink can't add latency to the call path
/// it's observing.
pub fn emitter_from_sink<S>(sink: S) -> Emitter
where
    S: TelemetrySink + Send + Sync + 'static,
    S::Future: Send + 'static,
{
    Arc::new(move |event: PolicyEvent| {
        let sink = sink.clone();
        tokio::spawn(emit_best_effort(sink, event));
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_event_display_includes_variant_name() {
        let event = PolicyEvent::Retry(RetryEvent::Attempt { attempt: 2, delay: Duration::from_millis(100) });
        assert!(event.to_string().contains("Attempt"));
        assert!(event.to_string().contains("#2"));
    }

    #[test]
    fn circuit_breaker_event_display() {
        let event = CircuitBreakerEvent::Opened { failure_count: 5 };
        assert!(event.to_string().contains("Opened"));
        assert!(event.to_string().contains('5'));
    }

    #[test]
    fn policy_event_clone_eq() {
        let event =
            PolicyEvent::Retry(RetryEvent::Attempt { attempt: 1, delay: Duration::from_millis(50) });
        assert_eq!(event.clone(), event);
    }

    #[tokio::test]
    async fn null_sink_discards() {
        let mut sink = NullSink;
        sink.call(PolicyEvent::Timeout(TimeoutEvent::Occurred { timeout: Duration::from_secs(1) }))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn memory_sink_evicts_oldest() {
        let mut sink = MemorySink::with_capacity(2);
        assert!(sink.is_empty());

        let e1 = PolicyEvent::Retry(RetryEvent::Attempt { attempt: 1, delay: Duration::from_millis(10) });
        let e2 = PolicyEvent::CircuitBreaker(CircuitBreakerEvent::Opened { failure_count: 3 });
        let e3 = PolicyEvent::Timeout(TimeoutEvent::Occurred { timeout: Duration::from_secs(1) });

        sink.call(e1.clone()).await.unwrap();
        sink.call(e2.clone()).await.unwrap();
        sink.call(e3.clone()).await.unwrap();

        assert_eq!(sink.len(), 2);
        assert_eq!(sink.evicted(), 1);
        let events = sink.events();
        assert_eq!(events[0], e2);
        assert_eq!(events[1], e3);

        sink.clear();
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn emit_best_effort_swallows_sink_errors() {
        #[derive(Clone)]
        struct Fails;
        impl TelemetrySink for Fails {
            type SinkError = std::io::Error;
        }
        impl tower::Service<PolicyEvent> for Fails {
            type Response = ();
            type Error = std::io::Error;
            type Future =
                Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;
            fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
                Poll::Ready(Ok(()))
            }
            fn call(&mut self, _event: PolicyEvent) -> Self::Future {
                Box::pin(async { Err(std::io::Error::other("fail")) })
            }
        }

        emit_best_effort(
            Fails,
            PolicyEvent::Timeout(TimeoutEvent::Occurred { timeout: Duration::from_millis(1) }),
        )
        .await;
    }

    #[tokio::test]
    async fn emitter_from_sink_delivers_to_memory_sink() {
        let sink = MemorySink::with_capacity(4);
        let emitter = emitter_from_sink(sink.clone());
        emitter(PolicyEvent::Bulkhead(BulkheadEvent::Rejected { active_count: 2, max_concurrency: 2 }));

        // Emission is spawned, so give the runtime a moment to run it.
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(sink.len(), 1);
    }
}
