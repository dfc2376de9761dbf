//! Deferred task submission for the async retry path.
//!
//! The sync path sleeps the caller's thread in place (see `sleeper.rs`); the
//! async path instead defers re-entry onto the runtime via `Scheduler`, so a
//! long retry delay never blocks a worker thread (spec.md §4.2, §5).

use std::time::Duration;

use futures::future::BoxFuture;
use tokio::task::JoinHandle;

/// A handle to a scheduled task that may be cancelled before it starts.
pub struct ScheduledTask {
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    /// Cancel the task. If it has not yet started running, it never will.
    /// If it is already running or finished, this has no further effect.
    pub fn cancel(&self) {
        self.handle.abort();
    }
}

/// Submits delayed work onto whatever runtime backs the implementation. The
/// core only requires that delayed tasks eventually run and that
/// cancellation prevents a not-yet-started task from running; no ordering
/// or fairness guarantee is assumed.
///
/// Takes a boxed future rather than a generic method so the trait stays
/// object-safe: `stack.rs` holds the composed stack's scheduler as
/// `Arc<dyn Scheduler>`, shared across every policy layer and swappable for
/// a deterministic test double.
pub trait Scheduler: Send + Sync + std::fmt::Debug {
    fn schedule(&self, delay: Duration, task: BoxFuture<'static, ()>) -> ScheduledTask;
}

/// `Scheduler` backed by `tokio::time::sleep` + `tokio::task::spawn`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, task: BoxFuture<'static, ()>) -> ScheduledTask {
        let handle = tokio::task::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            task.await;
        });
        ScheduledTask { handle }
    }
}
