//! Work dispatch to out-of-process action workers.
//!
//! This module provides:
//!
//! - [`ActionInvocation`]: Self-contained dispatch payload for a worker
//! - [`QueueTransport`]: Trait over the distributed queue transport
//! - [`DispatchClient`]: Publish with retry, queue pressure, and heartbeats
//! - [`InMemoryQueueTransport`]: In-memory transport for testing
//!
//! ## Design Principles
//!
//! - **Backend agnostic**: Same interface for Redis streams, SQS, local queues
//! - **Self-contained payloads**: A worker needs no further lookups
//! - **Transient failure isolation**: Queue unavailability never corrupts
//!   persisted DeltaFile state; publishes are retried before the caller
//!   considers the mutation committed

pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use conflux_core::Did;

use crate::error::{Error, Result};
use crate::flow::Flow;
use crate::metrics::EngineMetrics;
use crate::plan::ActionConfiguration;

/// Shared heartbeat key asserted by every dispatcher.
pub const SHARED_HEARTBEAT_KEY: &str = "conflux";

/// Base backoff for queue publish retries.
const BACKOFF_BASE: Duration = Duration::from_millis(100);

/// Maximum backoff between queue publish retries.
const BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Stable per-process identity used to namespace heartbeats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceIdentity {
    id: String,
}

impl InstanceIdentity {
    /// Creates an identity from an externally assigned id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    /// Generates a fresh identity for deployments without one assigned.
    #[must_use]
    pub fn generate() -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
        }
    }

    /// Returns the raw instance id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the identity-scoped queue name.
    ///
    /// This queue is both the dispatcher's return address for completion
    /// events and its identity-scoped heartbeat key.
    #[must_use]
    pub fn queue_name(&self) -> String {
        format!("{SHARED_HEARTBEAT_KEY}-{}", self.id)
    }
}

/// Snapshot of the flow an invocation executes within.
///
/// Carried inside the invocation so the worker sees a consistent view without
/// reloading the DeltaFile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowView {
    /// Flow name.
    pub name: String,
    /// Flow sequence number within the DeltaFile.
    pub number: u32,
    /// Join fan-in depth of the flow.
    pub depth: u32,
    /// Whether the flow runs in test mode.
    #[serde(default)]
    pub test_mode: bool,
    /// Provenance of the test-mode flag.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_mode_reason: Option<String>,
}

impl From<&Flow> for FlowView {
    fn from(flow: &Flow) -> Self {
        Self {
            name: flow.name.clone(),
            number: flow.number,
            depth: flow.depth,
            test_mode: flow.test_mode,
            test_mode_reason: flow.test_mode_reason.clone(),
        }
    }
}

/// Self-contained dispatch record for one action execution.
///
/// Ephemeral: built immediately before publish, never persisted with the
/// DeltaFile.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionInvocation {
    /// Configuration of the action to execute.
    pub action_config: ActionConfiguration,
    /// Snapshot of the owning flow.
    pub flow: FlowView,
    /// Target DeltaFile(s): one did for ordinary actions, the joined member
    /// set (in join order) for aggregates.
    pub dids: Vec<Did>,
    /// The synthetic aggregate did, when this invocation fans in.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregate_did: Option<Did>,
    /// Where the worker posts its completion event.
    pub return_address: String,
    /// Name of the system that produced the invocation.
    pub system_name: String,
    /// When the invocation was created.
    pub created: DateTime<Utc>,
}

impl ActionInvocation {
    /// Returns the queue this invocation is addressed to.
    ///
    /// Queues are named by action type; every worker for a type consumes one
    /// shared queue.
    #[must_use]
    pub fn queue_name(&self) -> &str {
        &self.action_config.action_type
    }
}

/// Outcome of asking the dispatch client to enqueue an invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Published to the worker queue.
    Published,
    /// Parked: the target queue is over its pressure threshold. The caller
    /// records the action COLD_QUEUED; an external warmer requeues it.
    Cold,
}

/// Distributed queue transport.
///
/// Implementations may target Redis streams, SQS, or local in-memory queues.
/// All failures must surface as [`Error::QueueUnavailable`] so callers can
/// distinguish transient infrastructure trouble from logic errors.
#[async_trait]
pub trait QueueTransport: Send + Sync {
    /// Publishes an invocation to the named queue.
    async fn publish(&self, queue: &str, invocation: ActionInvocation) -> Result<()>;

    /// Removes every pending invocation on the named queues.
    ///
    /// Used when a plugin's actions are withdrawn; guarantees no orphaned
    /// dispatch. Returns the number of invocations removed.
    async fn drop_queues(&self, queue_names: &[String]) -> Result<usize>;

    /// Asserts dispatcher liveness under the given key.
    async fn set_heartbeat(&self, key: &str, now: DateTime<Utc>) -> Result<()>;

    /// Returns the approximate number of pending invocations on a queue.
    async fn queue_depth(&self, queue: &str) -> Result<usize>;
}

/// Dispatch client: publish with bounded retry, cold-queue pressure handling,
/// and fixed-interval heartbeats.
pub struct DispatchClient {
    transport: Arc<dyn QueueTransport>,
    identity: InstanceIdentity,
    retry_attempts: u32,
    cold_queue_threshold: usize,
    metrics: EngineMetrics,
}

impl DispatchClient {
    /// Creates a dispatch client over the given transport.
    #[must_use]
    pub fn new(
        transport: Arc<dyn QueueTransport>,
        identity: InstanceIdentity,
        retry_attempts: u32,
        cold_queue_threshold: usize,
    ) -> Self {
        Self {
            transport,
            identity,
            retry_attempts,
            cold_queue_threshold,
            metrics: EngineMetrics::new(),
        }
    }

    /// Returns the dispatcher identity.
    #[must_use]
    pub fn identity(&self) -> &InstanceIdentity {
        &self.identity
    }

    /// Enqueues an invocation on the queue named by its action type.
    ///
    /// Transient transport failures are retried with bounded exponential
    /// backoff; when retries are exhausted the last [`Error::QueueUnavailable`]
    /// propagates so the caller never treats the dispatch as committed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::QueueUnavailable`] after exhausting retries.
    pub async fn enqueue(&self, invocation: ActionInvocation) -> Result<EnqueueOutcome> {
        let queue = invocation.queue_name().to_owned();

        let depth = self.transport.queue_depth(&queue).await.unwrap_or(0);
        if depth >= self.cold_queue_threshold {
            debug!(%queue, depth, "queue over pressure threshold, parking cold");
            return Ok(EnqueueOutcome::Cold);
        }
        self.metrics.set_queue_depth(&queue, depth);

        let mut backoff = BACKOFF_BASE;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.transport.publish(&queue, invocation.clone()).await {
                Ok(()) => return Ok(EnqueueOutcome::Published),
                Err(err @ Error::QueueUnavailable { .. }) if attempt < self.retry_attempts => {
                    warn!(%queue, attempt, error = %err, "queue publish failed, retrying");
                    self.metrics.record_queue_retry(&queue);
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(BACKOFF_MAX);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Removes all pending invocations addressed to the given action types.
    ///
    /// # Errors
    ///
    /// Returns [`Error::QueueUnavailable`] when the transport is unreachable.
    pub async fn drop_actions(&self, queue_names: &[String]) -> Result<usize> {
        self.transport.drop_queues(queue_names).await
    }

    /// Asserts liveness for this dispatcher's identity-scoped key and the
    /// shared key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::QueueUnavailable`] when the transport is unreachable.
    pub async fn heartbeat(&self, now: DateTime<Utc>) -> Result<()> {
        self.transport
            .set_heartbeat(&self.identity.queue_name(), now)
            .await?;
        self.transport.set_heartbeat(SHARED_HEARTBEAT_KEY, now).await
    }

    /// Runs the fixed-interval heartbeat loop until the task is aborted.
    ///
    /// Runs independently of event processing; failures are logged and the
    /// loop keeps ticking.
    pub fn start_heartbeat(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let client = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(err) = client.heartbeat(Utc::now()).await {
                    warn!(error = %err, "dispatcher heartbeat failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::memory::InMemoryQueueTransport;
    use super::*;
    use crate::flow::Flow;

    fn test_invocation(action_type: &str) -> ActionInvocation {
        let flow = Flow::new("ingress", 0, vec![], Utc::now());
        ActionInvocation {
            action_config: ActionConfiguration::new("validate", action_type),
            flow: FlowView::from(&flow),
            dids: vec![Did::generate()],
            aggregate_did: None,
            return_address: "orchestrator-1".into(),
            system_name: "conflux-test".into(),
            created: Utc::now(),
        }
    }

    #[test]
    fn queue_name_is_action_type() {
        let invocation = test_invocation("transform");
        assert_eq!(invocation.queue_name(), "transform");
    }

    #[test]
    fn identity_queue_name_is_namespaced() {
        let identity = InstanceIdentity::new("node-7");
        assert_eq!(identity.queue_name(), "conflux-node-7");
    }

    #[tokio::test]
    async fn enqueue_publishes_to_typed_queue() -> Result<()> {
        let transport = Arc::new(InMemoryQueueTransport::new());
        let client = DispatchClient::new(
            Arc::clone(&transport) as Arc<dyn QueueTransport>,
            InstanceIdentity::generate(),
            3,
            100,
        );

        let outcome = client.enqueue(test_invocation("transform")).await?;
        assert_eq!(outcome, EnqueueOutcome::Published);
        assert_eq!(transport.queue_depth("transform").await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn enqueue_parks_cold_over_threshold() -> Result<()> {
        let transport = Arc::new(InMemoryQueueTransport::new());
        let client = DispatchClient::new(
            Arc::clone(&transport) as Arc<dyn QueueTransport>,
            InstanceIdentity::generate(),
            3,
            1,
        );

        assert_eq!(
            client.enqueue(test_invocation("transform")).await?,
            EnqueueOutcome::Published
        );
        assert_eq!(
            client.enqueue(test_invocation("transform")).await?,
            EnqueueOutcome::Cold
        );
        // Nothing extra was published.
        assert_eq!(transport.queue_depth("transform").await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn enqueue_retries_transient_outage() -> Result<()> {
        let transport = Arc::new(InMemoryQueueTransport::new());
        transport.fail_next_publishes(2);
        let client = DispatchClient::new(
            Arc::clone(&transport) as Arc<dyn QueueTransport>,
            InstanceIdentity::generate(),
            5,
            100,
        );

        let outcome = client.enqueue(test_invocation("transform")).await?;
        assert_eq!(outcome, EnqueueOutcome::Published);
        assert_eq!(transport.queue_depth("transform").await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn enqueue_surfaces_persistent_outage() {
        let transport = Arc::new(InMemoryQueueTransport::new());
        transport.fail_next_publishes(10);
        let client = DispatchClient::new(
            Arc::clone(&transport) as Arc<dyn QueueTransport>,
            InstanceIdentity::generate(),
            2,
            100,
        );

        let err = client.enqueue(test_invocation("transform")).await.unwrap_err();
        assert!(matches!(err, Error::QueueUnavailable { .. }));
    }

    #[tokio::test]
    async fn heartbeat_touches_both_keys() -> Result<()> {
        let transport = Arc::new(InMemoryQueueTransport::new());
        let identity = InstanceIdentity::new("node-3");
        let client = DispatchClient::new(
            Arc::clone(&transport) as Arc<dyn QueueTransport>,
            identity,
            3,
            100,
        );

        let now = Utc::now();
        client.heartbeat(now).await?;
        assert_eq!(transport.heartbeat("conflux-node-3"), Some(now));
        assert_eq!(transport.heartbeat(SHARED_HEARTBEAT_KEY), Some(now));
        Ok(())
    }
}
