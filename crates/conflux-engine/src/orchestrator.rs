//! The orchestrator: drives DeltaFiles through their flows.
//!
//! Every inbound completion event follows one pipeline: acquire the did's
//! mutex → load the DeltaFile cache-first → advance the state machine →
//! persist → build and enqueue any resulting invocations. The mutex guard is
//! released on every exit path, including errors, because it is dropped with
//! the stack frame.
//!
//! The per-did mutex serializes mutation within this process only; when an
//! optimistic-lock conflict shows another instance won the durable race, the
//! cached copy is evicted and the whole load-advance-persist cycle retries
//! against the fresh state, up to the configured bound.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use conflux_core::Did;

use crate::action::{ActionError, ActionState};
use crate::advance::{advance, build_action_input, AdvanceOutcome};
use crate::cache::DeltaFileCache;
use crate::config::EngineConfig;
use crate::delta_file::DeltaFile;
use crate::dispatch::{DispatchClient, EnqueueOutcome};
use crate::error::{Error, Result};
use crate::events::ActionEvent;
use crate::flow::{Flow, FlowEventKind};
use crate::join::{create_aggregate_input, JoinEntry};
use crate::metrics::EngineMetrics;
use crate::mutex::DidMutexRegistry;
use crate::plan::{ActionConfiguration, FlowPlanSource};

/// Integrates the cache, flow execution model, mutex registry, and dispatch
/// queue into the event-processing pipeline.
pub struct Orchestrator {
    cache: Arc<dyn DeltaFileCache>,
    plan: Arc<dyn FlowPlanSource>,
    dispatch: Arc<DispatchClient>,
    mutexes: Arc<DidMutexRegistry>,
    config: EngineConfig,
    system_name: String,
    metrics: EngineMetrics,
}

impl Orchestrator {
    /// Creates an orchestrator over the given collaborators.
    #[must_use]
    pub fn new(
        cache: Arc<dyn DeltaFileCache>,
        plan: Arc<dyn FlowPlanSource>,
        dispatch: Arc<DispatchClient>,
        config: EngineConfig,
        system_name: impl Into<String>,
    ) -> Self {
        Self {
            cache,
            plan,
            dispatch,
            mutexes: Arc::new(DidMutexRegistry::new()),
            config,
            system_name: system_name.into(),
            metrics: EngineMetrics::new(),
        }
    }

    /// Returns the mutex registry (shared with ingress and admin surfaces).
    #[must_use]
    pub fn mutexes(&self) -> Arc<DidMutexRegistry> {
        Arc::clone(&self.mutexes)
    }

    fn return_address(&self) -> String {
        self.dispatch.identity().queue_name()
    }

    /// Processes one inbound completion event.
    ///
    /// # Errors
    ///
    /// - [`Error::DeltaFileNotFound`] when the did is unknown.
    /// - Validation and configuration errors from [`advance`].
    /// - [`Error::OptimisticLock`] when the retry bound is exhausted.
    /// - [`Error::QueueUnavailable`] when follow-on dispatch stays down.
    pub async fn handle_event(&self, event: ActionEvent) -> Result<AdvanceOutcome> {
        let mutex = self.mutexes.get_mutex(event.did);
        let _guard = mutex.lock().await;

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let mut delta_file = self
                .cache
                .get(event.did)
                .await?
                .ok_or(Error::DeltaFileNotFound { did: event.did })?;

            let outcome = advance(&mut delta_file, &event, self.plan.as_ref(), Utc::now())?;
            if outcome == AdvanceOutcome::Discarded {
                self.metrics.record_event("discarded");
                return Ok(outcome);
            }

            match self.cache.save(&mut delta_file).await {
                Ok(()) => {
                    if let AdvanceOutcome::ActionQueued { flow, action } = &outcome {
                        self.dispatch_queued_action(&mut delta_file, flow, action)
                            .await?;
                    }
                    self.metrics.record_event(outcome_label(&outcome));
                    return Ok(outcome);
                }
                Err(Error::OptimisticLock { did, .. }) if attempt < self.config.max_save_attempts => {
                    warn!(%did, attempt, "optimistic lock conflict, reloading");
                    self.metrics.record_lock_conflict();
                    self.cache.evict(did).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Cancels a DeltaFile.
    ///
    /// Allowed any time before COMPLETE; idempotent. Once cancelled no
    /// further dispatch occurs and late results are discarded.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeltaFileNotFound`] when the did is unknown.
    pub async fn cancel(&self, did: Did) -> Result<()> {
        let mutex = self.mutexes.get_mutex(did);
        let _guard = mutex.lock().await;

        let mut delta_file = self
            .cache
            .get(did)
            .await?
            .ok_or(Error::DeltaFileNotFound { did })?;
        delta_file.cancel(Utc::now());
        self.cache.save(&mut delta_file).await
    }

    /// Resumes an errored flow, requeuing and dispatching its errored action.
    ///
    /// When the per-flow error cap is configured and exhausted, the flow is
    /// cancelled instead and `None` is returned.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeltaFileNotFound`] / [`Error::FlowNotFound`] for
    /// unknown targets, and dispatch errors from requeuing.
    pub async fn resume(&self, did: Did, flow_name: &str) -> Result<Option<String>> {
        let mutex = self.mutexes.get_mutex(did);
        let _guard = mutex.lock().await;
        let now = Utc::now();

        let mut delta_file = self
            .cache
            .get(did)
            .await?
            .ok_or(Error::DeltaFileNotFound { did })?;
        let flow = delta_file
            .flow(flow_name)
            .ok_or_else(|| Error::FlowNotFound {
                did,
                flow: flow_name.to_owned(),
            })?;

        let cap = self.config.max_flow_errors as usize;
        if cap > 0 && flow.error_count() >= cap {
            warn!(%did, flow = flow_name, cap, "error cap exhausted, cancelling flow");
            if let Some(flow) = delta_file.flow_mut(flow_name) {
                flow.cancel(now);
            }
            delta_file.update_stage(now);
            self.cache.save(&mut delta_file).await?;
            return Ok(None);
        }

        let Some(action) = delta_file.resume(flow_name, now) else {
            return Ok(None);
        };
        self.cache.save(&mut delta_file).await?;
        self.dispatch_queued_action(&mut delta_file, flow_name, &action)
            .await?;
        Ok(Some(action))
    }

    /// Completes a join: builds the aggregate, persists it, then dispatches
    /// the join action that references it.
    ///
    /// Returns the aggregate's did.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DepthExceeded`] when the aggregate's depth breaks the
    /// configured policy bound; every member's triggering flow is marked
    /// ERROR first.
    pub async fn complete_join(
        &self,
        join_action: &ActionConfiguration,
        triggering_flow: &Flow,
        entry: &JoinEntry,
    ) -> Result<Did> {
        if entry.max_flow_depth > self.config.max_join_depth {
            self.reject_deep_join(triggering_flow, entry).await?;
            return Err(Error::DepthExceeded {
                did: entry.id,
                depth: entry.max_flow_depth,
                max_depth: self.config.max_join_depth,
            });
        }

        let now = Utc::now();
        let (mut aggregate, invocation) = create_aggregate_input(
            join_action,
            triggering_flow,
            entry,
            &entry.pending_dids,
            ActionState::Queued,
            &self.system_name,
            &self.return_address(),
            now,
        )?;

        // The aggregate must exist durably before a worker can reference it.
        {
            let mutex = self.mutexes.get_mutex(aggregate.did);
            let _guard = mutex.lock().await;
            self.cache.save(&mut aggregate).await?;

            match self.dispatch.enqueue(invocation).await? {
                EnqueueOutcome::Published => {}
                EnqueueOutcome::Cold => {
                    self.park_cold(&mut aggregate, &triggering_flow.name).await?;
                }
            }
        }

        // Record the lineage edge on each member.
        for member in &entry.pending_dids {
            let mutex = self.mutexes.get_mutex(*member);
            let _guard = mutex.lock().await;
            if let Some(mut member_file) = self.cache.get(*member).await? {
                member_file.child_dids.push(aggregate.did);
                member_file.modified = now;
                self.cache.save(&mut member_file).await?;
            }
        }

        debug!(aggregate = %aggregate.did, members = entry.pending_dids.len(), "join aggregated");
        Ok(aggregate.did)
    }

    /// Flushes the cache; call on shutdown.
    ///
    /// # Errors
    ///
    /// Propagates the first flush failure.
    pub async fn shutdown(&self) -> Result<()> {
        self.cache.flush().await
    }

    /// Runs the scheduled cache flush-and-evict loop until aborted.
    ///
    /// Independent of event processing; failures are logged and the loop
    /// keeps ticking.
    pub fn start_cache_maintenance(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let orchestrator = self;
        let interval = orchestrator.config.cache_sync_interval;
        let max_age = orchestrator.config.cache_max_age;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(err) = orchestrator.cache.flush().await {
                    warn!(error = %err, "scheduled cache flush failed");
                }
                match orchestrator.cache.remove_older_than(max_age, Utc::now()).await {
                    Ok(evicted) if evicted > 0 => {
                        debug!(evicted, "evicted idle cache entries");
                    }
                    Ok(_) => {}
                    Err(err) => warn!(error = %err, "cache eviction failed"),
                }
            }
        })
    }

    /// Builds and enqueues the invocation for a freshly queued action,
    /// parking it cold when the target queue is over pressure.
    async fn dispatch_queued_action(
        &self,
        delta_file: &mut DeltaFile,
        flow_name: &str,
        action: &str,
    ) -> Result<()> {
        let config = self.plan.action_configuration(flow_name, action)?;
        let flow = delta_file
            .flow(flow_name)
            .ok_or_else(|| Error::FlowNotFound {
                did: delta_file.did,
                flow: flow_name.to_owned(),
            })?;
        let invocation = build_action_input(
            config,
            delta_file,
            flow,
            self.return_address(),
            &self.system_name,
            Utc::now(),
        );

        match self.dispatch.enqueue(invocation).await? {
            EnqueueOutcome::Published => Ok(()),
            EnqueueOutcome::Cold => self.park_cold(delta_file, flow_name).await,
        }
    }

    /// Marks the head action of a flow COLD_QUEUED and persists.
    async fn park_cold(&self, delta_file: &mut DeltaFile, flow_name: &str) -> Result<()> {
        let now = Utc::now();
        let did = delta_file.did;
        let flow = delta_file
            .flow_mut(flow_name)
            .ok_or_else(|| Error::FlowNotFound {
                did,
                flow: flow_name.to_owned(),
            })?;
        let name = if let Some(action) = flow.head_action_mut() {
            action.state = ActionState::ColdQueued;
            action.modified = now;
            action.name.clone()
        } else {
            return Ok(());
        };
        flow.record_event(Some(name.as_str()), FlowEventKind::ActionColdQueued, now);
        self.cache.save(delta_file).await
    }

    /// Marks every member's triggering flow ERROR after a rejected join.
    async fn reject_deep_join(&self, triggering_flow: &Flow, entry: &JoinEntry) -> Result<()> {
        let now = Utc::now();
        let cause = format!(
            "join depth {} exceeds maximum {}",
            entry.max_flow_depth, self.config.max_join_depth
        );
        for member in &entry.pending_dids {
            let mutex = self.mutexes.get_mutex(*member);
            let _guard = mutex.lock().await;
            let Some(mut delta_file) = self.cache.get(*member).await? else {
                warn!(did = %member, "join member vanished before depth rejection");
                continue;
            };
            if let Some(flow) = delta_file.flow_mut(&triggering_flow.name) {
                flow.record_error(ActionError::new(cause.clone()), now, now, now);
            }
            delta_file.update_stage(now);
            self.cache.save(&mut delta_file).await?;
        }
        Ok(())
    }
}

fn outcome_label(outcome: &AdvanceOutcome) -> &'static str {
    match outcome {
        AdvanceOutcome::ActionQueued { .. } => "action_queued",
        AdvanceOutcome::FlowCompleted { .. } => "flow_completed",
        AdvanceOutcome::Completed => "completed",
        AdvanceOutcome::Errored { .. } => "errored",
        AdvanceOutcome::Discarded => "discarded",
    }
}
