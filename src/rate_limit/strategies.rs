//! Smooth (token bucket) and bursty (fixed window) rate limiter strategies.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::clock::{Clock, MonotonicClock};
use crate::rate_limit::store::TokenStore;
use crate::rate_limit::{Decision, RateLimiter, RateLimiterConfigError};

const MAX_CAS_ATTEMPTS: usize = 3;

/// Smooth admission: tokens refill continuously at `rate` per second up to
/// `capacity`, refreshed lazily against a `TokenStore` via optimistic CAS.
pub struct TokenBucket<S> {
    store: Arc<S>,
    bucket_key: String,
    rate: f64,
    capacity: f64,
    clock: Arc<dyn Clock>,
}

impl<S: TokenStore> TokenBucket<S> {
    pub fn new(
        store: Arc<S>,
        bucket_key: impl Into<String>,
        rate: f64,
        capacity: f64,
    ) -> Result<Self, RateLimiterConfigError> {
        if rate <= 0.0 || capacity <= 0.0 {
            return Err(RateLimiterConfigError::InvalidTokenBucket);
        }
        Ok(Self {
            store,
            bucket_key: bucket_key.into(),
            rate,
            capacity,
            clock: Arc::new(MonotonicClock::default()),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

#[async_trait]
impl<S: TokenStore> RateLimiter for TokenBucket<S> {
    async fn acquire(&self, permits: u32) -> Decision {
        let permits = permits as f64;
        for _ in 0..MAX_CAS_ATTEMPTS {
            let now = self.clock.now_millis();
            let existing = self.store.get_state(&self.bucket_key).await;
            let (tokens, updated_at, prev) = match existing {
                Some((tokens, updated_at)) => (tokens, updated_at, Some(updated_at)),
                None => (self.capacity, now, None),
            };

            let elapsed_secs = now.saturating_sub(updated_at) as f64 / 1000.0;
            let refreshed = (tokens + elapsed_secs * self.rate).min(self.capacity);

            if refreshed >= permits {
                let remaining = refreshed - permits;
                if self.store.set_state(&self.bucket_key, remaining, now, prev).await {
                    return Decision::Allowed { remaining };
                }
                // Lost the race to a concurrent caller; retry with fresh state.
                continue;
            }

            let deficit = permits - refreshed;
            let wait_secs = if self.rate > 0.0 { deficit / self.rate } else { f64::MAX };
            return Decision::Denied {
                wait: Duration::from_secs_f64(wait_secs.max(0.0)),
                reason: "token_bucket_insufficient",
            };
        }
        Decision::Denied { wait: Duration::from_millis(1), reason: "token_bucket_contention" }
    }
}

/// Bursty admission: a fixed count of permits per rolling window, reset
/// wholesale at window boundaries rather than refilling continuously.
pub struct FixedWindowLimiter {
    limit: usize,
    window: Duration,
    clock: Arc<dyn Clock>,
    window_start_millis: AtomicU64,
    count: AtomicUsize,
}

impl FixedWindowLimiter {
    pub fn new(limit: usize, window: Duration) -> Result<Self, RateLimiterConfigError> {
        if limit == 0 || window.is_zero() {
            return Err(RateLimiterConfigError::InvalidFixedWindow);
        }
        Ok(Self {
            limit,
            window,
            clock: Arc::new(MonotonicClock::default()),
            window_start_millis: AtomicU64::new(0),
            count: AtomicUsize::new(0),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

#[async_trait]
impl RateLimiter for FixedWindowLimiter {
    async fn acquire(&self, permits: u32) -> Decision {
        let permits = permits as usize;
        let now = self.clock.now_millis();
        let window_millis = self.window.as_millis() as u64;

        let window_start = self.window_start_millis.load(Ordering::Acquire);
        if now.saturating_sub(window_start) >= window_millis {
            // New window: reset the counter. A lost race here just means an
            // extra reset, which is harmless (count is reset to the same
            // starting point either way).
            self.window_start_millis.store(now, Ordering::Release);
            self.count.store(0, Ordering::Release);
        }

        let updated = self.count.fetch_add(permits, Ordering::AcqRel) + permits;
        if updated <= self.limit {
            Decision::Allowed { remaining: (self.limit - updated) as f64 }
        } else {
            self.count.fetch_sub(permits, Ordering::AcqRel);
            let window_start = self.window_start_millis.load(Ordering::Acquire);
            let elapsed = now.saturating_sub(window_start);
            let wait = Duration::from_millis(window_millis.saturating_sub(elapsed));
            Decision::Denied { wait, reason: "fixed_window_exhausted" }
        }
    }
}
