//! Token bucket state storage, behind an optimistic compare-and-swap
//! interface so multiple bucket keys can share one store without a
//! per-key lock held across an await point.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

/// Persists `(tokens, updated_at_millis)` per bucket key with optimistic
/// concurrency control: `set_state` only applies if `prev_updated_at`
/// matches what is currently stored (or the key is absent and
/// `prev_updated_at` is `None`).
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn get_state(&self, key: &str) -> Option<(f64, u64)>;

    /// Returns `true` if the write was applied, `false` if a concurrent
    /// writer had already moved `updated_at` past `prev_updated_at`.
    async fn set_state(
        &self,
        key: &str,
        tokens: f64,
        updated_at: u64,
        prev_updated_at: Option<u64>,
    ) -> bool;
}

/// In-process token store. The distributed backend the teacher's
/// abstraction anticipated is out of scope (Non-goal: no distributed
/// coordination of policy state across nodes).
#[derive(Default)]
pub struct InMemoryTokenStore {
    data: Mutex<HashMap<String, (f64, u64)>>,
}

impl InMemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    async fn get_state(&self, key: &str) -> Option<(f64, u64)> {
        self.data.lock().unwrap().get(key).copied()
    }

    async fn set_state(
        &self,
        key: &str,
        tokens: f64,
        updated_at: u64,
        prev_updated_at: Option<u64>,
    ) -> bool {
        let mut data = self.data.lock().unwrap();
        let current = data.get(key).copied();
        let matches = match (current, prev_updated_at) {
            (None, None) => true,
            (Some((_, cur_updated)), Some(prev)) => cur_updated == prev,
            _ => false,
        };
        if matches {
            data.insert(key.to_string(), (tokens, updated_at));
        }
        matches
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_state_rejects_stale_write() {
        let store = InMemoryTokenStore::new();
        assert!(store.set_state("k", 10.0, 100, None).await);
        assert!(!store.set_state("k", 5.0, 200, None).await);
        assert!(store.set_state("k", 5.0, 200, Some(100)).await);
        assert_eq!(store.get_state("k").await, Some((5.0, 200)));
    }
}
