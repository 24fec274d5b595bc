//! The DeltaFile entity: a tracked data object moving through flows.
//!
//! A DeltaFile is created at ingress or by join aggregation, mutated only
//! through action-completion events processed by the orchestrator, and
//! removed by an external retention sweep. The `version` field is the
//! optimistic-concurrency token: the durable store increments it by exactly
//! one on every persisted mutation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use conflux_core::Did;

use crate::flow::{Flow, FlowState};

/// DeltaFile lifecycle stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    /// One or more flows still have work outstanding.
    InFlight,
    /// Every flow reached COMPLETE.
    Complete,
    /// At least one flow errored.
    Error,
    /// Cancelled before completion.
    Cancelled,
}

impl Stage {
    /// Returns true if this is a terminal stage.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Cancelled)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InFlight => write!(f, "IN_FLIGHT"),
            Self::Complete => write!(f, "COMPLETE"),
            Self::Error => write!(f, "ERROR"),
            Self::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// A tracked data object moving through one or more flows.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaFile {
    /// Durable unique identifier; immutable for the object's lifetime.
    pub did: Did,
    /// Current lifecycle stage.
    pub stage: Stage,
    /// Optimistic-concurrency token. Increases by exactly one per persisted
    /// mutation; a fresh, never-persisted object carries version 0.
    pub version: u64,
    /// When the object was created.
    pub created: DateTime<Utc>,
    /// Last mutation.
    pub modified: DateTime<Utc>,
    /// Ordered flows applied to this object.
    #[serde(default)]
    pub flows: Vec<Flow>,
    /// Lineage: dids this object was derived from. For a join aggregate this
    /// equals precisely the joined member set, in join order.
    #[serde(default)]
    pub parent_dids: Vec<Did>,
    /// Lineage: dids derived from this object.
    #[serde(default)]
    pub child_dids: Vec<Did>,
    /// Cache bookkeeping: last touch. Never persisted.
    #[serde(skip)]
    pub cache_time: Option<DateTime<Utc>>,
    /// Cache bookkeeping: unsaved in-memory changes. Never persisted.
    #[serde(skip)]
    pub dirty: bool,
}

impl DeltaFile {
    /// Creates a new in-flight DeltaFile with no flows.
    #[must_use]
    pub fn new(did: Did, now: DateTime<Utc>) -> Self {
        Self {
            did,
            stage: Stage::InFlight,
            version: 0,
            created: now,
            modified: now,
            flows: Vec::new(),
            parent_dids: Vec::new(),
            child_dids: Vec::new(),
            cache_time: None,
            dirty: false,
        }
    }

    /// Appends a flow, assigning the next sequence number.
    pub fn add_flow(&mut self, mut flow: Flow) {
        flow.number = self.flows.len() as u32;
        self.flows.push(flow);
    }

    /// Returns the named flow.
    #[must_use]
    pub fn flow(&self, name: &str) -> Option<&Flow> {
        self.flows.iter().find(|f| f.name == name)
    }

    /// Returns the named flow mutably.
    pub fn flow_mut(&mut self, name: &str) -> Option<&mut Flow> {
        self.flows.iter_mut().find(|f| f.name == name)
    }

    /// Recomputes the stage from flow states.
    ///
    /// ERROR when any flow errored; COMPLETE when every flow is terminal and
    /// none errored; otherwise IN_FLIGHT. An explicitly CANCELLED object keeps
    /// its stage.
    pub fn update_stage(&mut self, now: DateTime<Utc>) {
        if self.stage == Stage::Cancelled {
            return;
        }
        let next = if self.flows.iter().any(|f| f.state == FlowState::Error) {
            Stage::Error
        } else if !self.flows.is_empty() && self.flows.iter().all(|f| f.state.is_terminal()) {
            Stage::Complete
        } else {
            Stage::InFlight
        };
        if next != self.stage {
            self.stage = next;
            self.modified = now;
        }
    }

    /// Cancels the object and every non-complete flow.
    ///
    /// Allowed any time before COMPLETE; idempotent. Once cancelled no further
    /// dispatch occurs and late-arriving results are discarded.
    pub fn cancel(&mut self, now: DateTime<Utc>) {
        if self.stage == Stage::Complete || self.stage == Stage::Cancelled {
            return;
        }
        for flow in &mut self.flows {
            flow.cancel(now);
        }
        self.stage = Stage::Cancelled;
        self.modified = now;
    }

    /// Resumes the named errored flow, requeuing its errored action.
    ///
    /// Returns the requeued action name when the flow had an errored head.
    pub fn resume(&mut self, flow_name: &str, now: DateTime<Utc>) -> Option<String> {
        let resumed = self.flow_mut(flow_name)?.resume(now)?;
        self.update_stage(now);
        self.modified = now;
        Some(resumed)
    }

    /// Returns true when the object is cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.stage == Stage::Cancelled
    }

    /// Returns the maximum flow depth across this object's flows.
    #[must_use]
    pub fn max_flow_depth(&self) -> u32 {
        self.flows.iter().map(|f| f.depth).max().unwrap_or(0)
    }

    /// Updates the cache last-touch time.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.cache_time = Some(now);
    }
}
