//! Flow state and per-flow action history.
//!
//! A flow is one configured pipeline applied to a DeltaFile. Flows keep:
//!
//! - `pending_actions`: the ordered names of actions not yet queued
//! - `actions`: the append-only history of action attempts; the most recent
//!   non-terminal entry is the flow's single dispatch-eligible head
//! - `events`: an append-only log of every transition, for audit and resume

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::action::{Action, ActionError, ActionState};

/// Flow state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowState {
    /// Created, no action queued yet.
    Pending,
    /// Actively executing actions.
    InFlight,
    /// All actions completed (or the object was filtered out).
    Complete,
    /// An action errored and the flow stopped.
    Error,
    /// Cancelled by user or system.
    Cancelled,
}

impl FlowState {
    /// Returns true if this is a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error | Self::Cancelled)
    }

    /// Returns true if the transition from self to target is valid.
    #[must_use]
    pub fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Pending => matches!(target, Self::InFlight | Self::Cancelled),
            Self::InFlight => matches!(target, Self::Complete | Self::Error | Self::Cancelled),
            // Resume requeues an errored flow.
            Self::Error => matches!(target, Self::InFlight | Self::Cancelled),
            Self::Complete | Self::Cancelled => false,
        }
    }
}

impl std::fmt::Display for FlowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::InFlight => write!(f, "IN_FLIGHT"),
            Self::Complete => write!(f, "COMPLETE"),
            Self::Error => write!(f, "ERROR"),
            Self::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// One entry in the append-only per-flow event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowEvent {
    /// When the event occurred.
    pub at: DateTime<Utc>,
    /// The action involved, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// What happened.
    pub kind: FlowEventKind,
}

/// The kind of a flow event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum FlowEventKind {
    /// An action was queued for dispatch.
    ActionQueued,
    /// An action was parked cold.
    ActionColdQueued,
    /// A worker reported completion.
    ActionCompleted,
    /// A worker reported an error.
    ActionErrored {
        /// The reported cause.
        cause: String,
    },
    /// A worker filtered the object out of the flow.
    ActionFiltered {
        /// The reported filter cause.
        cause: String,
    },
    /// An errored action was requeued by resume.
    ActionRetried,
    /// The flow completed.
    FlowCompleted,
    /// The flow errored.
    FlowErrored,
    /// The flow was cancelled.
    FlowCancelled,
}

/// A configured pipeline of actions applied to a DeltaFile.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flow {
    /// Flow name, unique within the DeltaFile.
    pub name: String,
    /// Sequence number, ordering flows within the DeltaFile.
    pub number: u32,
    /// Join fan-in bound. Carried through chained joins; never decreases.
    pub depth: u32,
    /// Current state.
    pub state: FlowState,
    /// When the flow was created.
    pub created: DateTime<Utc>,
    /// Last modification.
    pub modified: DateTime<Utc>,
    /// Ordered names of actions not yet queued.
    #[serde(default)]
    pub pending_actions: Vec<String>,
    /// Append-only action attempt history.
    #[serde(default)]
    pub actions: Vec<Action>,
    /// Append-only transition log.
    #[serde(default)]
    pub events: Vec<FlowEvent>,
    /// Whether results are withheld from egress for this flow.
    #[serde(default)]
    pub test_mode: bool,
    /// Provenance of the test-mode flag.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_mode_reason: Option<String>,
}

impl Flow {
    /// Creates a new pending flow.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        number: u32,
        pending_actions: Vec<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            number,
            depth: 0,
            state: FlowState::Pending,
            created: now,
            modified: now,
            pending_actions,
            actions: Vec::new(),
            events: Vec::new(),
            test_mode: false,
            test_mode_reason: None,
        }
    }

    /// Sets the join fan-in depth.
    #[must_use]
    pub const fn with_depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self
    }

    /// Enables test mode with the given provenance reason.
    #[must_use]
    pub fn with_test_mode(mut self, reason: impl Into<String>) -> Self {
        self.test_mode = true;
        self.test_mode_reason = Some(reason.into());
        self
    }

    /// Returns the dispatch-eligible head action, if any.
    ///
    /// An IN_FLIGHT flow always has exactly one non-terminal action; it is the
    /// last entry of the history.
    #[must_use]
    pub fn head_action(&self) -> Option<&Action> {
        self.actions.last().filter(|a| !a.state.is_terminal())
    }

    /// Returns the head action mutably.
    pub fn head_action_mut(&mut self) -> Option<&mut Action> {
        self.actions.last_mut().filter(|a| !a.state.is_terminal())
    }

    /// Appends an event to the flow log.
    pub fn record_event(&mut self, action: Option<&str>, kind: FlowEventKind, at: DateTime<Utc>) {
        self.events.push(FlowEvent {
            at,
            action: action.map(str::to_owned),
            kind,
        });
    }

    /// Queues the next pending action, if one remains.
    ///
    /// Moves the flow IN_FLIGHT and returns the name of the queued action.
    /// The caller resolves the action type and records the attempt via
    /// [`Flow::push_action`].
    pub fn take_next_pending(&mut self) -> Option<String> {
        if self.pending_actions.is_empty() {
            return None;
        }
        Some(self.pending_actions.remove(0))
    }

    /// Pushes a new action attempt onto the history.
    pub fn push_action(&mut self, action: Action, now: DateTime<Utc>) {
        let kind = if action.state == ActionState::ColdQueued {
            FlowEventKind::ActionColdQueued
        } else {
            FlowEventKind::ActionQueued
        };
        self.record_event(Some(action.name.as_str()), kind, now);
        self.actions.push(action);
        self.state = FlowState::InFlight;
        self.modified = now;
    }

    /// Marks the flow complete.
    pub fn complete(&mut self, now: DateTime<Utc>) {
        self.state = FlowState::Complete;
        self.record_event(None, FlowEventKind::FlowCompleted, now);
        self.modified = now;
    }

    /// Marks the flow errored.
    pub fn error(&mut self, now: DateTime<Utc>) {
        self.state = FlowState::Error;
        self.record_event(None, FlowEventKind::FlowErrored, now);
        self.modified = now;
    }

    /// Cancels the flow, its head action, and all pending work.
    ///
    /// Idempotent; completed flows are left untouched.
    pub fn cancel(&mut self, now: DateTime<Utc>) {
        if self.state.is_terminal() && self.state != FlowState::Error {
            return;
        }
        self.pending_actions.clear();
        if let Some(action) = self.head_action_mut() {
            action.cancel(now);
        }
        self.state = FlowState::Cancelled;
        self.record_event(None, FlowEventKind::FlowCancelled, now);
        self.modified = now;
    }

    /// Requeues the errored head of this flow, marking the old attempt RETRIED.
    ///
    /// Returns the name of the requeued action, or `None` when the flow has no
    /// errored action to resume.
    pub fn resume(&mut self, now: DateTime<Utc>) -> Option<String> {
        if self.state != FlowState::Error {
            return None;
        }
        let errored = self
            .actions
            .iter_mut()
            .rev()
            .find(|a| a.state == ActionState::Error)?;
        errored.mark_retried(now);
        let name = errored.name.clone();
        let action_type = errored.action_type.clone();
        self.record_event(Some(name.as_str()), FlowEventKind::ActionRetried, now);
        self.actions
            .push(Action::new(&name, action_type, ActionState::Queued, now));
        self.record_event(Some(name.as_str()), FlowEventKind::ActionQueued, now);
        self.state = FlowState::InFlight;
        self.modified = now;
        Some(name)
    }

    /// Returns true when the flow still has queued or pending work.
    #[must_use]
    pub fn has_pending_work(&self) -> bool {
        !self.pending_actions.is_empty() || self.head_action().is_some()
    }

    /// Counts errored attempts across the history.
    #[must_use]
    pub fn error_count(&self) -> usize {
        self.actions
            .iter()
            .filter(|a| matches!(a.state, ActionState::Error | ActionState::Retried))
            .count()
    }

    /// Records the head action errored and moves the flow to ERROR.
    pub fn record_error(
        &mut self,
        error: ActionError,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
        now: DateTime<Utc>,
    ) {
        let cause = error.cause.clone();
        let name = self.head_action().map(|a| a.name.clone());
        if let Some(action) = self.head_action_mut() {
            action.error(error, start, stop, now);
        }
        self.record_event(
            name.as_deref(),
            FlowEventKind::ActionErrored { cause },
            now,
        );
        self.error(now);
    }
}
