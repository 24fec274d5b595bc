//! In-memory queue transport for testing.
//!
//! This module provides [`InMemoryQueueTransport`], a simple in-memory
//! implementation of the [`QueueTransport`] trait suitable for testing and
//! single-process deployments.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: No persistence, no distribution
//! - **Single-process only**: Queues are not visible across process boundaries

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{ActionInvocation, QueueTransport};
use crate::error::{Error, Result};

/// Internal transport state protected by a single lock.
#[derive(Debug, Default)]
struct TransportState {
    queues: HashMap<String, VecDeque<ActionInvocation>>,
    heartbeats: HashMap<String, DateTime<Utc>>,
}

/// In-memory queue transport for testing.
///
/// Thread-safe via `RwLock`. Supports injected publish failures so callers
/// can exercise the retry path.
#[derive(Debug, Default)]
pub struct InMemoryQueueTransport {
    state: RwLock<TransportState>,
    failing_publishes: AtomicU32,
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("queue transport lock poisoned")
}

impl InMemoryQueueTransport {
    /// Creates a new empty transport.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` publishes fail with QueueUnavailable.
    pub fn fail_next_publishes(&self, count: u32) {
        self.failing_publishes.store(count, Ordering::SeqCst);
    }

    /// Takes the next invocation from the named queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn take(&self, queue: &str) -> Result<Option<ActionInvocation>> {
        let mut state = self.state.write().map_err(poison_err)?;
        let entry = state.queues.get_mut(queue).and_then(VecDeque::pop_front);
        drop(state);
        Ok(entry)
    }

    /// Returns all invocations currently pending on the named queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn pending(&self, queue: &str) -> Result<Vec<ActionInvocation>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state
            .queues
            .get(queue)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default())
    }

    /// Returns the last heartbeat recorded under the given key.
    #[must_use]
    pub fn heartbeat(&self, key: &str) -> Option<DateTime<Utc>> {
        let state = self
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        state.heartbeats.get(key).copied()
    }
}

#[async_trait]
impl QueueTransport for InMemoryQueueTransport {
    async fn publish(&self, queue: &str, invocation: ActionInvocation) -> Result<()> {
        if self
            .failing_publishes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::queue_unavailable(queue));
        }

        let mut state = self.state.write().map_err(poison_err)?;
        state
            .queues
            .entry(queue.to_owned())
            .or_default()
            .push_back(invocation);
        drop(state);
        Ok(())
    }

    async fn drop_queues(&self, queue_names: &[String]) -> Result<usize> {
        let mut state = self.state.write().map_err(poison_err)?;
        let mut removed = 0;
        for name in queue_names {
            if let Some(queue) = state.queues.remove(name) {
                removed += queue.len();
            }
        }
        drop(state);
        Ok(removed)
    }

    async fn set_heartbeat(&self, key: &str, now: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.heartbeats.insert(key.to_owned(), now);
        drop(state);
        Ok(())
    }

    async fn queue_depth(&self, queue: &str) -> Result<usize> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.queues.get(queue).map_or(0, VecDeque::len))
    }
}
