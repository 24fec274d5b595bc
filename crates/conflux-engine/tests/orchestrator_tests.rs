//! End-to-end orchestrator pipeline tests: completion events in, state
//! transitions and dispatched invocations out.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use conflux_core::Did;
use conflux_engine::action::ActionState;
use conflux_engine::advance::AdvanceOutcome;
use conflux_engine::cache::{build_cache, DeltaFileCache};
use conflux_engine::config::{CacheVariant, EngineConfig};
use conflux_engine::delta_file::{DeltaFile, Stage};
use conflux_engine::dispatch::memory::InMemoryQueueTransport;
use conflux_engine::dispatch::{DispatchClient, InstanceIdentity, QueueTransport};
use conflux_engine::error::{Error, Result};
use conflux_engine::events::ActionEvent;
use conflux_engine::flow::{Flow, FlowState};
use conflux_engine::join::{JoinDefinition, JoinTracker};
use conflux_engine::orchestrator::Orchestrator;
use conflux_engine::plan::{ActionConfiguration, StaticPlanSource};
use conflux_engine::store::memory::InMemoryDeltaFileStore;
use conflux_engine::store::DeltaFileStore;
use conflux_engine::Action;

struct Harness {
    orchestrator: Arc<Orchestrator>,
    store: Arc<InMemoryDeltaFileStore>,
    transport: Arc<InMemoryQueueTransport>,
    cache: Arc<dyn DeltaFileCache>,
    plan: Arc<StaticPlanSource>,
}

fn harness_with(config: EngineConfig) -> Harness {
    let store = Arc::new(InMemoryDeltaFileStore::new());
    let cache = build_cache(&config, Arc::clone(&store) as Arc<dyn DeltaFileStore>);
    let transport = Arc::new(InMemoryQueueTransport::new());
    let dispatch = Arc::new(DispatchClient::new(
        Arc::clone(&transport) as Arc<dyn QueueTransport>,
        InstanceIdentity::new("test-node"),
        config.queue_retry_attempts,
        config.cold_queue_threshold,
    ));
    let plan = Arc::new(StaticPlanSource::new());
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&cache),
        Arc::clone(&plan) as Arc<dyn conflux_engine::plan::FlowPlanSource>,
        dispatch,
        config,
        "conflux-test",
    ));
    Harness {
        orchestrator,
        store,
        transport,
        cache,
        plan,
    }
}

fn harness() -> Harness {
    harness_with(EngineConfig::default())
}

/// Plays the ingress subsystem: registers the flow plan, creates the
/// DeltaFile with its first action queued, and persists it through the cache
/// contract.
async fn ingress(harness: &Harness, flow_name: &str, actions: &[(&str, &str)]) -> Result<DeltaFile> {
    for (name, action_type) in actions {
        harness
            .plan
            .register(flow_name, ActionConfiguration::new(*name, *action_type));
    }

    let now = Utc::now();
    let mut delta_file = DeltaFile::new(Did::generate(), now);
    let mut flow = Flow::new(
        flow_name,
        0,
        actions.iter().map(|(name, _)| (*name).to_owned()).collect(),
        now,
    );
    let first = flow.take_next_pending().expect("flow needs an action");
    let first_type = actions[0].1;
    flow.push_action(Action::new(&first, first_type, ActionState::Queued, now), now);
    delta_file.add_flow(flow);

    harness.cache.save(&mut delta_file).await?;
    Ok(delta_file)
}

#[tokio::test]
async fn completion_queues_and_dispatches_next_action() -> Result<()> {
    let harness = harness();
    let df = ingress(
        &harness,
        "ingress",
        &[("validate", "transform"), ("normalize", "transform")],
    )
    .await?;

    let now = Utc::now();
    let outcome = harness
        .orchestrator
        .handle_event(ActionEvent::complete(df.did, "ingress", "validate", now, now))
        .await?;

    assert_eq!(
        outcome,
        AdvanceOutcome::ActionQueued {
            flow: "ingress".into(),
            action: "normalize".into()
        }
    );

    // The follow-on invocation landed on the typed queue, self-contained.
    let pending = harness.transport.pending("transform")?;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].dids, vec![df.did]);
    assert_eq!(pending[0].action_config.name, "normalize");
    assert_eq!(pending[0].return_address, "conflux-test-node");
    Ok(())
}

#[tokio::test]
async fn last_action_completion_completes_the_delta_file() -> Result<()> {
    let harness = harness();
    let df = ingress(&harness, "ingress", &[("validate", "transform")]).await?;

    let now = Utc::now();
    let outcome = harness
        .orchestrator
        .handle_event(ActionEvent::complete(df.did, "ingress", "validate", now, now))
        .await?;
    assert_eq!(outcome, AdvanceOutcome::Completed);

    let stored = harness.cache.get(df.did).await?.unwrap();
    assert_eq!(stored.stage, Stage::Complete);
    assert_eq!(stored.flow("ingress").unwrap().state, FlowState::Complete);
    assert_eq!(harness.transport.queue_depth("transform").await?, 0);
    Ok(())
}

#[tokio::test]
async fn error_marks_flow_and_file_and_dispatches_nothing() -> Result<()> {
    let harness = harness();
    let df = ingress(
        &harness,
        "ingress",
        &[("validate", "transform"), ("normalize", "transform")],
    )
    .await?;

    let now = Utc::now();
    let outcome = harness
        .orchestrator
        .handle_event(ActionEvent::error(
            df.did, "ingress", "validate", "schema mismatch", now, now,
        ))
        .await?;
    assert_eq!(
        outcome,
        AdvanceOutcome::Errored {
            flow: "ingress".into()
        }
    );

    let stored = harness.cache.get(df.did).await?.unwrap();
    assert_eq!(stored.stage, Stage::Error);
    assert_eq!(stored.flow("ingress").unwrap().state, FlowState::Error);
    assert_eq!(harness.transport.queue_depth("transform").await?, 0);
    Ok(())
}

#[tokio::test]
async fn late_result_for_cancelled_file_is_discarded() -> Result<()> {
    let harness = harness();
    let df = ingress(&harness, "ingress", &[("validate", "transform")]).await?;

    harness.orchestrator.cancel(df.did).await?;

    let now = Utc::now();
    let outcome = harness
        .orchestrator
        .handle_event(ActionEvent::complete(df.did, "ingress", "validate", now, now))
        .await?;
    assert_eq!(outcome, AdvanceOutcome::Discarded);

    let stored = harness.cache.get(df.did).await?.unwrap();
    assert_eq!(stored.stage, Stage::Cancelled);
    assert_eq!(harness.transport.queue_depth("transform").await?, 0);
    Ok(())
}

#[tokio::test]
async fn unknown_did_is_not_found() {
    let harness = harness();
    let now = Utc::now();
    let err = harness
        .orchestrator
        .handle_event(ActionEvent::complete(
            Did::generate(),
            "ingress",
            "validate",
            now,
            now,
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DeltaFileNotFound { .. }));
}

#[tokio::test]
async fn resume_requeues_and_dispatches_errored_action() -> Result<()> {
    let harness = harness();
    let df = ingress(&harness, "ingress", &[("validate", "transform")]).await?;

    let now = Utc::now();
    harness
        .orchestrator
        .handle_event(ActionEvent::error(df.did, "ingress", "validate", "boom", now, now))
        .await?;

    let resumed = harness.orchestrator.resume(df.did, "ingress").await?;
    assert_eq!(resumed.as_deref(), Some("validate"));

    let stored = harness.cache.get(df.did).await?.unwrap();
    assert_eq!(stored.stage, Stage::InFlight);
    assert_eq!(stored.flow("ingress").unwrap().state, FlowState::InFlight);

    let pending = harness.transport.pending("transform")?;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].action_config.name, "validate");
    Ok(())
}

#[tokio::test]
async fn resume_past_error_cap_cancels_the_flow() -> Result<()> {
    let config = EngineConfig {
        max_flow_errors: 1,
        ..EngineConfig::default()
    };
    let harness = harness_with(config);
    let df = ingress(&harness, "ingress", &[("validate", "transform")]).await?;

    let now = Utc::now();
    harness
        .orchestrator
        .handle_event(ActionEvent::error(df.did, "ingress", "validate", "boom", now, now))
        .await?;

    let resumed = harness.orchestrator.resume(df.did, "ingress").await?;
    assert!(resumed.is_none());

    let stored = harness.cache.get(df.did).await?.unwrap();
    assert_eq!(stored.flow("ingress").unwrap().state, FlowState::Cancelled);
    assert_eq!(harness.transport.queue_depth("transform").await?, 0);
    Ok(())
}

#[tokio::test]
async fn cold_threshold_parks_action_instead_of_publishing() -> Result<()> {
    let config = EngineConfig {
        cold_queue_threshold: 0,
        ..EngineConfig::default()
    };
    let harness = harness_with(config);
    let df = ingress(
        &harness,
        "ingress",
        &[("validate", "transform"), ("normalize", "transform")],
    )
    .await?;

    let now = Utc::now();
    harness
        .orchestrator
        .handle_event(ActionEvent::complete(df.did, "ingress", "validate", now, now))
        .await?;

    let stored = harness.cache.get(df.did).await?.unwrap();
    let head = stored.flow("ingress").unwrap().head_action().unwrap().clone();
    assert_eq!(head.name, "normalize");
    assert_eq!(head.state, ActionState::ColdQueued);
    assert_eq!(harness.transport.queue_depth("transform").await?, 0);
    Ok(())
}

#[tokio::test]
async fn queue_outage_surfaces_after_state_is_persisted() -> Result<()> {
    let config = EngineConfig {
        queue_retry_attempts: 2,
        ..EngineConfig::default()
    };
    let harness = harness_with(config);
    let df = ingress(
        &harness,
        "ingress",
        &[("validate", "transform"), ("normalize", "transform")],
    )
    .await?;

    harness.transport.fail_next_publishes(10);
    let now = Utc::now();
    let err = harness
        .orchestrator
        .handle_event(ActionEvent::complete(df.did, "ingress", "validate", now, now))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::QueueUnavailable { .. }));

    // The persisted state is intact; the queued action awaits redispatch.
    let stored = harness.cache.get(df.did).await?.unwrap();
    let head = stored.flow("ingress").unwrap().head_action().unwrap().clone();
    assert_eq!(head.name, "normalize");
    assert_eq!(head.state, ActionState::Queued);
    Ok(())
}

#[tokio::test]
async fn join_persists_aggregate_before_dispatching() -> Result<()> {
    let config = EngineConfig {
        cache_variant: CacheVariant::PassThrough,
        ..EngineConfig::default()
    };
    let harness = harness_with(config);

    let join_config = ActionConfiguration::new("merge", "join").with_join(JoinDefinition::new(3));
    harness.plan.register("merge-flow", join_config.clone());

    let member_dids = [
        ingress(&harness, "merge-flow", &[("feed", "transform")]).await?.did,
        ingress(&harness, "merge-flow", &[("feed", "transform")]).await?.did,
        ingress(&harness, "merge-flow", &[("feed", "transform")]).await?.did,
    ];

    let tracker = JoinTracker::new();
    let definition = JoinDefinition::new(3);
    let now = Utc::now();
    let triggering_flow = Flow::new("merge-flow", 0, vec![], now);

    let mut fired = None;
    for member in member_dids {
        fired = tracker.append("orders", &definition, 0, member, now)?;
    }
    let entry = fired.expect("third member fires the join");

    let aggregate_did = harness
        .orchestrator
        .complete_join(&join_config, &triggering_flow, &entry)
        .await?;

    // Durable before dispatch: the aggregate is in the store.
    let aggregate = harness.store.find_by_id(aggregate_did).await?.unwrap();
    assert_eq!(aggregate.parent_dids, member_dids);
    assert_eq!(aggregate.stage, Stage::InFlight);
    assert_eq!(aggregate.flows.len(), 1);

    let pending = harness.transport.pending("join")?;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].dids, member_dids);
    assert_eq!(pending[0].aggregate_did, Some(aggregate_did));

    // The lineage DAG gained an edge on every member.
    for member in member_dids {
        let stored = harness.store.find_by_id(member).await?.unwrap();
        assert_eq!(stored.child_dids, vec![aggregate_did]);
    }
    Ok(())
}

#[tokio::test]
async fn join_past_depth_bound_is_rejected_and_members_error() -> Result<()> {
    let config = EngineConfig {
        max_join_depth: 2,
        cache_variant: CacheVariant::PassThrough,
        ..EngineConfig::default()
    };
    let harness = harness_with(config);

    let join_config = ActionConfiguration::new("merge", "join").with_join(JoinDefinition::new(2));
    let member_a = ingress(&harness, "merge-flow", &[("feed", "transform")]).await?;
    let member_b = ingress(&harness, "merge-flow", &[("feed", "transform")]).await?;

    let tracker = JoinTracker::new();
    let definition = JoinDefinition::new(2);
    let now = Utc::now();
    tracker.append("orders", &definition, 5, member_a.did, now)?;
    let entry = tracker
        .append("orders", &definition, 1, member_b.did, now)?
        .expect("second member fires the join");

    let triggering_flow = Flow::new("merge-flow", 0, vec![], now);
    let err = harness
        .orchestrator
        .complete_join(&join_config, &triggering_flow, &entry)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DepthExceeded { depth: 6, .. }));

    // No aggregate was persisted and no invocation published.
    assert!(harness.store.find_by_id(entry.id).await?.is_none());
    assert_eq!(harness.transport.queue_depth("join").await?, 0);

    // Both members' triggering flows errored.
    for member in [member_a.did, member_b.did] {
        let stored = harness.store.find_by_id(member).await?.unwrap();
        assert_eq!(stored.stage, Stage::Error);
        assert_eq!(stored.flow("merge-flow").unwrap().state, FlowState::Error);
    }
    Ok(())
}

/// Store wrapper that fails the first N CAS saves to exercise the
/// reload-and-retry path.
struct FlakyStore {
    inner: Arc<InMemoryDeltaFileStore>,
    failures_left: AtomicU32,
}

#[async_trait]
impl DeltaFileStore for FlakyStore {
    async fn insert_one(&self, delta_file: &DeltaFile) -> Result<()> {
        self.inner.insert_one(delta_file).await
    }

    async fn save_and_flush(&self, delta_file: &DeltaFile) -> Result<u64> {
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::OptimisticLock {
                did: delta_file.did,
                expected_version: delta_file.version,
            });
        }
        self.inner.save_and_flush(delta_file).await
    }

    async fn find_by_id(&self, did: Did) -> Result<Option<DeltaFile>> {
        self.inner.find_by_id(did).await
    }

    async fn find_by_ids(&self, dids: &[Did]) -> Result<Vec<DeltaFile>> {
        self.inner.find_by_ids(dids).await
    }
}

#[tokio::test]
async fn optimistic_conflict_is_retried_with_a_fresh_read() -> Result<()> {
    let inner = Arc::new(InMemoryDeltaFileStore::new());
    let flaky = Arc::new(FlakyStore {
        inner: Arc::clone(&inner),
        failures_left: AtomicU32::new(2),
    });

    let config = EngineConfig {
        cache_variant: CacheVariant::PassThrough,
        ..EngineConfig::default()
    };
    let cache = build_cache(&config, Arc::clone(&flaky) as Arc<dyn DeltaFileStore>);
    let transport = Arc::new(InMemoryQueueTransport::new());
    let dispatch = Arc::new(DispatchClient::new(
        Arc::clone(&transport) as Arc<dyn QueueTransport>,
        InstanceIdentity::new("test-node"),
        config.queue_retry_attempts,
        config.cold_queue_threshold,
    ));
    let plan = Arc::new(StaticPlanSource::new());
    plan.register("ingress", ActionConfiguration::new("validate", "transform"));
    let orchestrator = Orchestrator::new(
        Arc::clone(&cache),
        Arc::clone(&plan) as Arc<dyn conflux_engine::plan::FlowPlanSource>,
        dispatch,
        config,
        "conflux-test",
    );

    let now = Utc::now();
    let mut df = DeltaFile::new(Did::generate(), now);
    let mut flow = Flow::new("ingress", 0, vec![], now);
    flow.push_action(Action::new("validate", "transform", ActionState::Queued, now), now);
    df.add_flow(flow);
    cache.save(&mut df).await?;

    let outcome = orchestrator
        .handle_event(ActionEvent::complete(df.did, "ingress", "validate", now, now))
        .await?;
    assert_eq!(outcome, AdvanceOutcome::Completed);

    // Two injected conflicts, then the third attempt landed.
    assert_eq!(inner.find_by_id(df.did).await?.unwrap().version, 1);
    Ok(())
}

#[tokio::test]
async fn exhausted_retries_surface_the_conflict() -> Result<()> {
    let inner = Arc::new(InMemoryDeltaFileStore::new());
    let flaky = Arc::new(FlakyStore {
        inner,
        failures_left: AtomicU32::new(100),
    });

    let config = EngineConfig {
        cache_variant: CacheVariant::PassThrough,
        max_save_attempts: 3,
        ..EngineConfig::default()
    };
    let cache = build_cache(&config, Arc::clone(&flaky) as Arc<dyn DeltaFileStore>);
    let transport = Arc::new(InMemoryQueueTransport::new());
    let dispatch = Arc::new(DispatchClient::new(
        Arc::clone(&transport) as Arc<dyn QueueTransport>,
        InstanceIdentity::new("test-node"),
        config.queue_retry_attempts,
        config.cold_queue_threshold,
    ));
    let plan = Arc::new(StaticPlanSource::new());
    plan.register("ingress", ActionConfiguration::new("validate", "transform"));
    let orchestrator = Orchestrator::new(
        Arc::clone(&cache),
        Arc::clone(&plan) as Arc<dyn conflux_engine::plan::FlowPlanSource>,
        dispatch,
        config,
        "conflux-test",
    );

    let now = Utc::now();
    let mut df = DeltaFile::new(Did::generate(), now);
    let mut flow = Flow::new("ingress", 0, vec![], now);
    flow.push_action(Action::new("validate", "transform", ActionState::Queued, now), now);
    df.add_flow(flow);
    cache.save(&mut df).await?;

    let err = orchestrator
        .handle_event(ActionEvent::complete(df.did, "ingress", "validate", now, now))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::OptimisticLock { .. }));
    assert!(err.is_transient());
    Ok(())
}
