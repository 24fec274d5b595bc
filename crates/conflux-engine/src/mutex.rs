//! Per-did local exclusion tokens.
//!
//! All in-process mutation of one DeltaFile is serialized through the mutex
//! handed out here. The registry holds tokens weakly: once every caller has
//! dropped its handle the entry is reclaimed, so the map never grows with the
//! lifetime of the object population.
//!
//! This is a single-process guard only. Cross-instance correctness comes from
//! the durable store's optimistic versioning, not from this registry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};

use tokio::sync::Mutex;

use conflux_core::Did;

/// How many registrations between opportunistic dead-entry sweeps.
const PRUNE_INTERVAL: usize = 64;

/// Registry of per-did exclusion tokens.
#[derive(Debug, Default)]
pub struct DidMutexRegistry {
    inner: StdMutex<RegistryState>,
}

#[derive(Debug, Default)]
struct RegistryState {
    tokens: HashMap<Did, Weak<Mutex<()>>>,
    inserts_since_prune: usize,
}

impl DidMutexRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the exclusion token for a did, creating it atomically.
    ///
    /// Concurrent callers for the same did observe the same token for as long
    /// as any of them holds a strong reference.
    #[must_use]
    pub fn get_mutex(&self, did: Did) -> Arc<Mutex<()>> {
        let mut state = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = state.tokens.get(&did).and_then(Weak::upgrade) {
            return existing;
        }

        let token = Arc::new(Mutex::new(()));
        state.tokens.insert(did, Arc::downgrade(&token));
        state.inserts_since_prune += 1;
        if state.inserts_since_prune >= PRUNE_INTERVAL {
            state.tokens.retain(|_, weak| weak.strong_count() > 0);
            state.inserts_since_prune = 0;
        }
        token
    }

    /// Returns the number of live (still referenced) tokens.
    #[must_use]
    pub fn live_tokens(&self) -> usize {
        let state = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        state
            .tokens
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_did_observes_same_token_while_held() {
        let registry = DidMutexRegistry::new();
        let did = Did::generate();

        let first = registry.get_mutex(did);
        let second = registry.get_mutex(did);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn different_dids_get_different_tokens() {
        let registry = DidMutexRegistry::new();
        let a = registry.get_mutex(Did::generate());
        let b = registry.get_mutex(Did::generate());
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn reclaimed_token_is_replaced() {
        let registry = DidMutexRegistry::new();
        let did = Did::generate();

        let first = registry.get_mutex(did);
        let first_ptr = Arc::as_ptr(&first);
        drop(first);

        // Fully released, so a fresh token is created.
        let second = registry.get_mutex(did);
        assert_eq!(registry.live_tokens(), 1);
        // The old allocation may be reused, so compare liveness, not pointers.
        let _ = first_ptr;
        assert_eq!(Arc::strong_count(&second), 1);
    }

    #[test]
    fn dead_entries_are_pruned() {
        let registry = DidMutexRegistry::new();
        for _ in 0..(PRUNE_INTERVAL * 2) {
            let token = registry.get_mutex(Did::generate());
            drop(token);
        }
        assert_eq!(registry.live_tokens(), 0);
        let state = registry.inner.lock().unwrap();
        assert!(state.tokens.len() <= PRUNE_INTERVAL);
    }

    #[tokio::test]
    async fn token_serializes_critical_sections() {
        use std::sync::atomic::{AtomicU32, Ordering};

        let registry = Arc::new(DidMutexRegistry::new());
        let did = Did::generate();
        let counter = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            let counter = Arc::clone(&counter);
            handles.push(tokio::spawn(async move {
                let token = registry.get_mutex(did);
                let guard = token.lock().await;
                // Exactly one task inside the guarded section at a time.
                assert_eq!(counter.fetch_add(1, Ordering::SeqCst), 0);
                tokio::task::yield_now().await;
                assert_eq!(counter.fetch_sub(1, Ordering::SeqCst), 1);
                drop(guard);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
