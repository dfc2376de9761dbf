use resilience_engine::{
    Backoff, FallbackPolicy, Jitter, ResilienceError, ResilienceStack, ResilienceStackBuilder,
    RetryPolicy,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
struct TestError;

impl std::fmt::Display for TestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "test error")
    }
}

impl std::error::Error for TestError {}

#[tokio::test]
async fn retry_retries_inner_errors_then_succeeds() {
    let retry = RetryPolicy::builder()
        .max_attempts(3)
        .unwrap()
        .backoff(Backoff::constant(Duration::from_millis(0)))
        .with_jitter(Jitter::None)
        .build();

    let stack: ResilienceStack<(), TestError> =
        ResilienceStackBuilder::new().retry(retry).build();

    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts_clone = attempts.clone();

    let result = stack
        .execute(move || {
            let attempts = attempts_clone.clone();
            async move {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(ResilienceError::Inner(TestError))
                } else {
                    Ok(())
                }
            }
        })
        .await;

    assert!(result.is_ok());
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn bulkhead_rejects_when_full() {
    let stack: ResilienceStack<(), TestError> = ResilienceStackBuilder::new()
        .bulkhead(1)
        .timeout(Duration::from_secs(1))
        .unwrap()
        .build();

    let holding = stack.clone();
    let holder = tokio::spawn(async move {
        holding
            .execute(|| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<_, ResilienceError<TestError>>(())
            })
            .await
    });

    tokio::time::sleep(Duration::from_millis(20)).await;

    let rejected = stack.execute(|| async { Ok::<_, ResilienceError<TestError>>(()) }).await;

    assert!(matches!(rejected, Err(e) if e.is_bulkhead()));
    let _ = holder.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn timeout_triggers_on_slow_operation() {
    let stack: ResilienceStack<(), TestError> = ResilienceStackBuilder::new()
        .timeout(Duration::from_millis(50))
        .unwrap()
        .bulkhead(2)
        .build();

    let handle = tokio::spawn(async move {
        stack
            .execute(|| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<_, ResilienceError<TestError>>(())
            })
            .await
    });

    tokio::time::advance(Duration::from_millis(60)).await;
    let result = handle.await.unwrap();

    assert!(matches!(result, Err(e) if e.is_timeout()));
}

#[tokio::test]
async fn circuit_breaker_opens_after_failure() {
    let retry = RetryPolicy::builder()
        .max_attempts(1)
        .unwrap()
        .backoff(Backoff::constant(Duration::from_millis(0)))
        .with_jitter(Jitter::None)
        .build();

    let stack: ResilienceStack<(), TestError> = ResilienceStackBuilder::new()
        .circuit_breaker(1, Duration::from_secs(30))
        .unwrap()
        .retry(retry)
        .build();

    let _ = stack.execute(|| async { Err::<(), _>(ResilienceError::Inner(TestError)) }).await;

    let second = stack.execute(|| async { Ok::<(), ResilienceError<TestError>>(()) }).await;

    assert!(matches!(second, Err(e) if e.is_circuit_open()));
}

#[tokio::test]
async fn fallback_terminates_retry_across_the_stack() {
    // Scenario 3 (spec.md §8): Retry(maxRetries=5) outer, Fallback("x") inner.
    let retry = RetryPolicy::builder()
        .max_attempts(6)
        .unwrap()
        .backoff(Backoff::constant(Duration::from_millis(0)))
        .with_jitter(Jitter::None)
        .build();
    let fallback = FallbackPolicy::of_value(42);

    let stack: ResilienceStack<i32, TestError> =
        ResilienceStackBuilder::new().retry(retry).fallback(fallback).build();

    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts_clone = attempts.clone();

    let result = stack
        .execute(move || {
            attempts_clone.fetch_add(1, Ordering::SeqCst);
            async { Err::<i32, _>(ResilienceError::Inner(TestError)) }
        })
        .await;

    assert_eq!(result.unwrap(), 42);
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cancellation_mid_delay_stops_further_attempts() {
    // Scenario 6 (spec.md §8): cancel the outer future during a retry
    // delay; no further attempt should run afterwards.
    let retry = RetryPolicy::builder()
        .max_attempts(5)
        .unwrap()
        .backoff(Backoff::constant(Duration::from_secs(1)))
        .with_jitter(Jitter::None)
        .build();

    let stack: ResilienceStack<(), TestError> =
        ResilienceStackBuilder::new().retry(retry).build();

    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts_clone = attempts.clone();

    let future = stack.execute_async(move || {
        let attempts = attempts_clone.clone();
        async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(ResilienceError::Inner(TestError))
        }
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    future.cancel(true);
    let result = future.result().await;

    assert!(result.unwrap_err().is_cancelled());
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn async_runnable_records_out_of_band_and_retries() {
    // Scenario 5 (spec.md §8): the async runnable records its result from a
    // task it spawns rather than returning a future the engine awaits
    // directly; each retried attempt gets a fresh recorded slot, so the
    // runnable is invoked exactly once per attempt.
    let retry = RetryPolicy::builder()
        .max_attempts(3)
        .unwrap()
        .backoff(Backoff::constant(Duration::from_millis(0)))
        .with_jitter(Jitter::None)
        .build();

    let stack: ResilienceStack<i32, TestError> =
        ResilienceStackBuilder::new().retry(retry).build();

    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts_clone = attempts.clone();

    let future = stack.run_async(move |execution| {
        attempts_clone.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            execution.record(None, Some(ResilienceError::Inner(TestError)));
        });
    });

    let result = future.result().await;

    assert!(result.is_err());
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}
