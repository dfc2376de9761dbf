//! `FailsafeFuture`: the user-visible promise returned by the async
//! execution surface, with injectable per-policy cancel functions.

use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::error::ResilienceError;

/// A cancel callback registered by a policy (or the orchestration layer at
/// index `-1`), invoked at most once in descending-index order on
/// cancellation.
type CancelFn = Box<dyn FnOnce(bool) + Send>;

/// Reserved index for the orchestration layer's own cancel function (it
/// always runs last, since cancellation proceeds outer→inner and the
/// orchestration layer is the outermost thing).
pub const ORCHESTRATION_INDEX: i64 = -1;

struct CompletionSlot<T, E> {
    result: Mutex<Option<Result<T, ResilienceError<E>>>>,
    notify: Notify,
}

impl<T, E> CompletionSlot<T, E> {
    fn new() -> Self {
        Self { result: Mutex::new(None), notify: Notify::new() }
    }

    /// First writer wins; later calls are dropped (spec.md §3, §4.11: once
    /// the future is cancelled, no later `record` may transition the
    /// result).
    fn try_complete(&self, result: Result<T, ResilienceError<E>>) -> bool {
        let mut guard = self.result.lock().unwrap();
        if guard.is_some() {
            return false;
        }
        *guard = Some(result);
        drop(guard);
        self.notify.notify_waiters();
        true
    }

    fn is_complete(&self) -> bool {
        self.result.lock().unwrap().is_some()
    }
}

/// User-visible promise over a composed execution's eventual result.
///
/// Not a literal `impl std::future::Future` — per REDESIGN FLAGS, "use
/// whatever promise primitive the target runtime offers"; this crate uses a
/// completion slot plus `tokio::sync::Notify`, exposing an async `result()`
/// accessor and a synchronous `cancel()`.
pub struct FailsafeFuture<T, E> {
    slot: Arc<CompletionSlot<T, E>>,
    cancel_fns: Arc<Mutex<Vec<(i64, CancelFn)>>>,
}

impl<T, E> Clone for FailsafeFuture<T, E> {
    fn clone(&self) -> Self {
        Self { slot: self.slot.clone(), cancel_fns: self.cancel_fns.clone() }
    }
}

/// The producer-side handle used by the execution pipeline to complete a
/// `FailsafeFuture` and register cancel functions as policies are entered.
pub struct FailsafeFutureHandle<T, E> {
    slot: Arc<CompletionSlot<T, E>>,
    cancel_fns: Arc<Mutex<Vec<(i64, CancelFn)>>>,
}

impl<T, E> Clone for FailsafeFutureHandle<T, E> {
    fn clone(&self) -> Self {
        Self { slot: self.slot.clone(), cancel_fns: self.cancel_fns.clone() }
    }
}

/// Create a linked `(FailsafeFuture, FailsafeFutureHandle)` pair: the future
/// is handed to the caller, the handle is retained by the execution
/// pipeline.
pub fn pair<T, E>() -> (FailsafeFuture<T, E>, FailsafeFutureHandle<T, E>) {
    let slot = Arc::new(CompletionSlot::new());
    let cancel_fns = Arc::new(Mutex::new(Vec::new()));
    (
        FailsafeFuture { slot: slot.clone(), cancel_fns: cancel_fns.clone() },
        FailsafeFutureHandle { slot, cancel_fns },
    )
}

impl<T, E> FailsafeFuture<T, E> {
    /// Await the execution's final result.
    pub async fn result(&self) -> Result<T, ResilienceError<E>>
    where
        T: Clone,
        E: Clone,
    {
        loop {
            if let Some(result) = self.slot.result.lock().unwrap().clone() {
                return result;
            }
            self.slot.notify.notified().await;
        }
    }

    pub fn is_complete(&self) -> bool {
        self.slot.is_complete()
    }

    /// Cancel the execution: mark the future complete with
    /// `ResilienceError::Cancelled`, then invoke every registered cancel
    /// function in descending index order, each at most once. Late
    /// `record` calls from an in-flight attempt are silently dropped since
    /// the completion slot has already been filled.
    pub fn cancel(&self, may_interrupt: bool) -> bool {
        if !self.slot.try_complete(Err(ResilienceError::Cancelled)) {
            return false;
        }
        let mut fns = self.cancel_fns.lock().unwrap();
        fns.sort_by(|a, b| b.0.cmp(&a.0));
        for (_, cancel_fn) in fns.drain(..) {
            cancel_fn(may_interrupt);
        }
        true
    }
}

impl<T, E> FailsafeFutureHandle<T, E> {
    /// Register a cancel function at `policy_index` (use
    /// `ORCHESTRATION_INDEX` for the orchestration layer's own). No-op if
    /// the future is already complete.
    pub fn register_cancel_fn<F>(&self, policy_index: i64, cancel_fn: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        if self.slot.is_complete() {
            return;
        }
        self.cancel_fns.lock().unwrap().push((policy_index, Box::new(cancel_fn)));
    }

    /// Complete the future with the pipeline's final result. First writer
    /// wins; returns `false` if the future was already completed (e.g. by a
    /// racing `cancel()`).
    pub fn complete(&self, result: Result<T, ResilienceError<E>>) -> bool {
        let completed = self.slot.try_complete(result);
        if completed {
            self.cancel_fns.lock().unwrap().clear();
        }
        completed
    }

    pub fn is_complete(&self) -> bool {
        self.slot.is_complete()
    }
}
