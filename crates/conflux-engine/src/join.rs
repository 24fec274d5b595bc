//! Fan-in join and aggregation.
//!
//! A joining action merges several DeltaFiles into one synthetic aggregate.
//! Members accumulate under a [`JoinEntry`] until the join definition is
//! satisfied; [`create_aggregate_input`] then builds the aggregate DeltaFile
//! and the invocation that carries the joined members to the worker.
//!
//! The depth stamped on the aggregate's flow is one greater than the deepest
//! member flow, so chained joins carry an explicit, monotone bound that the
//! orchestrator checks against policy before aggregation is allowed.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use conflux_core::Did;

use crate::action::{Action, ActionState};
use crate::delta_file::DeltaFile;
use crate::dispatch::{ActionInvocation, FlowView};
use crate::error::{Error, Result};
use crate::flow::{Flow, FlowState};
use crate::plan::ActionConfiguration;

/// Plan-authored definition of a join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinDefinition {
    /// Minimum number of members required before a timeout may fire the join.
    #[serde(default)]
    pub min_num: usize,
    /// Member count at which the join fires immediately.
    pub max_num: usize,
    /// How long members may wait before the join fires with at least
    /// `min_num` members, in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_age_secs: Option<u64>,
}

impl JoinDefinition {
    /// Creates a definition that fires at exactly `max_num` members.
    #[must_use]
    pub const fn new(max_num: usize) -> Self {
        Self {
            min_num: 0,
            max_num,
            max_age_secs: None,
        }
    }

    /// Sets the minimum member count for timeout-driven joins.
    #[must_use]
    pub const fn with_min_num(mut self, min_num: usize) -> Self {
        self.min_num = min_num;
        self
    }

    /// Sets the member wait bound.
    #[must_use]
    pub const fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age_secs = Some(max_age.as_secs());
        self
    }
}

/// Accumulating state for one join group.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinEntry {
    /// Aggregate id; becomes the resulting DeltaFile's did.
    pub id: Did,
    /// One greater than the deepest member flow seen so far.
    pub max_flow_depth: u32,
    /// The definition this group joins under.
    pub definition: JoinDefinition,
    /// Members pending join, in arrival order.
    pub pending_dids: Vec<Did>,
    /// When the first member arrived.
    pub created: DateTime<Utc>,
}

impl JoinEntry {
    /// Returns true when enough members arrived to fire immediately.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.pending_dids.len() >= self.definition.max_num
    }

    /// Returns true when a timeout at `now` may fire this join.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let Some(max_age_secs) = self.definition.max_age_secs else {
            return false;
        };
        let deadline = self.created + chrono::Duration::seconds(max_age_secs as i64);
        now >= deadline && self.pending_dids.len() >= self.definition.min_num.max(1)
    }
}

/// In-memory accumulation of join members per group.
///
/// One tracker per orchestrator instance; the entry handed out by
/// [`JoinTracker::append`] or [`JoinTracker::take_expired`] is removed from
/// the tracker, so each group aggregates exactly once.
#[derive(Debug, Default)]
pub struct JoinTracker {
    entries: RwLock<HashMap<String, JoinEntry>>,
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("join tracker lock poisoned")
}

impl JoinTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a member to the named join group.
    ///
    /// Creates the group's entry on first arrival. Returns the completed
    /// entry, removed from the tracker, once `max_num` members arrived.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn append(
        &self,
        group: &str,
        definition: &JoinDefinition,
        flow_depth: u32,
        did: Did,
        now: DateTime<Utc>,
    ) -> Result<Option<JoinEntry>> {
        let mut entries = self.entries.write().map_err(poison_err)?;
        let entry = entries.entry(group.to_owned()).or_insert_with(|| JoinEntry {
            id: Did::generate(),
            max_flow_depth: 0,
            definition: definition.clone(),
            pending_dids: Vec::new(),
            created: now,
        });
        entry.pending_dids.push(did);
        entry.max_flow_depth = entry.max_flow_depth.max(flow_depth + 1);

        if entry.is_full() {
            let complete = entries.remove(group);
            drop(entries);
            return Ok(complete);
        }
        drop(entries);
        Ok(None)
    }

    /// Removes and returns every entry whose wait bound elapsed.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn take_expired(&self, now: DateTime<Utc>) -> Result<Vec<JoinEntry>> {
        let mut entries = self.entries.write().map_err(poison_err)?;
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(group, _)| group.clone())
            .collect();
        let taken = expired
            .iter()
            .filter_map(|group| entries.remove(group))
            .collect();
        drop(entries);
        Ok(taken)
    }

    /// Returns the number of groups currently accumulating.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn group_count(&self) -> Result<usize> {
        let entries = self.entries.read().map_err(poison_err)?;
        Ok(entries.len())
    }
}

/// Builds the synthetic aggregate DeltaFile and its join invocation.
///
/// The aggregate's did equals the join entry's id, its `parent_dids` are the
/// joined members in order, and its single flow is cloned from the triggering
/// flow, stamped with `join_entry.max_flow_depth`, holding exactly one action
/// (the join action) in the requested initial state.
///
/// Every timestamp on the aggregate comes from the single `now` argument, so
/// all sub-objects of one aggregation event agree on time.
///
/// Test mode propagates: a triggering flow in test mode makes the aggregate
/// inherit it with reason = the triggering flow's name; otherwise the
/// existing reason is carried unchanged.
///
/// # Errors
///
/// Returns [`Error::Validation`] when `state` is not QUEUED or COLD_QUEUED.
#[allow(clippy::too_many_arguments)]
pub fn create_aggregate_input(
    join_action: &ActionConfiguration,
    current_flow: &Flow,
    join_entry: &JoinEntry,
    joined_dids: &[Did],
    state: ActionState,
    system_name: &str,
    return_address: &str,
    now: DateTime<Utc>,
) -> Result<(DeltaFile, ActionInvocation)> {
    if !state.is_queued() {
        return Err(Error::validation(format!(
            "aggregate join action must start QUEUED or COLD_QUEUED, got {state}"
        )));
    }
    if joined_dids.is_empty() {
        return Err(Error::validation("aggregate requires at least one member"));
    }
    if joined_dids.contains(&join_entry.id) {
        return Err(Error::validation(format!(
            "aggregate {} cannot join itself",
            join_entry.id
        )));
    }

    let mut flow = Flow::new(
        &current_flow.name,
        0,
        current_flow.pending_actions.clone(),
        now,
    )
    .with_depth(join_entry.max_flow_depth);

    if current_flow.test_mode {
        flow = flow.with_test_mode(&current_flow.name);
    } else {
        flow.test_mode_reason = current_flow.test_mode_reason.clone();
    }

    flow.push_action(
        Action::new(&join_action.name, &join_action.action_type, state, now),
        now,
    );
    debug_assert_eq!(flow.state, FlowState::InFlight);

    let mut aggregate = DeltaFile::new(join_entry.id, now);
    aggregate.parent_dids = joined_dids.to_vec();
    aggregate.add_flow(flow);

    let invocation = ActionInvocation {
        action_config: join_action.clone(),
        flow: FlowView::from(&aggregate.flows[0]),
        dids: joined_dids.to_vec(),
        aggregate_did: Some(join_entry.id),
        return_address: return_address.to_owned(),
        system_name: system_name.to_owned(),
        created: now,
    };

    Ok((aggregate, invocation))
}
