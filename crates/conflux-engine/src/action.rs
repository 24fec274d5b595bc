//! Action execution records within a flow.
//!
//! This module provides:
//! - `ActionState`: The state machine for a single pluggable processing step
//! - `Action`: The per-attempt execution record kept in a flow's history
//! - `ActionError`: Error detail reported by a worker

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Action execution state machine.
///
/// Actions are executed by out-of-process workers; the engine only observes
/// transitions through completion events.
///
/// ```text
/// ┌────────┐ dispatched ┌───────────┐ result ┌──────────┬───────┬──────────┐
/// │ QUEUED │───────────►│ IN_FLIGHT │───────►│ COMPLETE │ ERROR │ FILTERED │
/// └────────┘            └───────────┘        └──────────┴───────┴──────────┘
///      ▲                                          ERROR ──resume──► RETRIED
/// ┌────┴────────┐
/// │ COLD_QUEUED │  (parked until queue pressure clears)
/// └─────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionState {
    /// Published to the dispatch queue, awaiting a worker.
    Queued,
    /// Parked because the target queue is over its pressure threshold.
    ColdQueued,
    /// Picked up by a worker, actively executing.
    InFlight,
    /// Completed successfully.
    Complete,
    /// Worker reported an error.
    Error,
    /// Worker filtered the object out of the flow.
    Filtered,
    /// A previously errored attempt that was requeued by resume.
    Retried,
    /// Cancelled before completion.
    Cancelled,
}

impl ActionState {
    /// Returns true if this is a terminal state for the attempt.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Complete | Self::Error | Self::Filtered | Self::Retried | Self::Cancelled
        )
    }

    /// Returns true if the action is waiting for dispatch or execution.
    #[must_use]
    pub const fn is_queued(&self) -> bool {
        matches!(self, Self::Queued | Self::ColdQueued)
    }

    /// Returns true if the transition from self to target is valid.
    #[must_use]
    pub fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Queued => matches!(target, Self::InFlight | Self::ColdQueued | Self::Cancelled),
            Self::ColdQueued => matches!(target, Self::Queued | Self::Cancelled),
            Self::InFlight => matches!(
                target,
                Self::Complete | Self::Error | Self::Filtered | Self::Cancelled
            ),
            Self::Error => matches!(target, Self::Retried | Self::Cancelled),
            Self::Complete | Self::Filtered | Self::Retried | Self::Cancelled => false,
        }
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::ColdQueued => "cold_queued",
            Self::InFlight => "in_flight",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::Filtered => "filtered",
            Self::Retried => "retried",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ActionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "QUEUED"),
            Self::ColdQueued => write!(f, "COLD_QUEUED"),
            Self::InFlight => write!(f, "IN_FLIGHT"),
            Self::Complete => write!(f, "COMPLETE"),
            Self::Error => write!(f, "ERROR"),
            Self::Filtered => write!(f, "FILTERED"),
            Self::Retried => write!(f, "RETRIED"),
            Self::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// Error detail reported by a worker for a failed action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionError {
    /// Short cause, suitable for grouping and display.
    pub cause: String,
    /// Free-form context (stack trace, worker diagnostics).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

impl ActionError {
    /// Creates a new action error.
    #[must_use]
    pub fn new(cause: impl Into<String>) -> Self {
        Self {
            cause: cause.into(),
            context: None,
        }
    }

    /// Sets the error context.
    #[must_use]
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

/// Execution record for one action attempt within a flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    /// Action name, unique within its flow.
    pub name: String,
    /// Action type; doubles as the dispatch queue name.
    #[serde(rename = "type")]
    pub action_type: String,
    /// Current state of this attempt.
    pub state: ActionState,
    /// When the record was created.
    pub created: DateTime<Utc>,
    /// When the action was queued for dispatch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queued: Option<DateTime<Utc>>,
    /// When the worker started executing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<DateTime<Utc>>,
    /// When the worker finished.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<DateTime<Utc>>,
    /// Last modification of this record.
    pub modified: DateTime<Utc>,
    /// Error detail, when state is ERROR.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ActionError>,
    /// Filter cause, when state is FILTERED.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filtered_cause: Option<String>,
}

impl Action {
    /// Creates a new action record in the given initial state.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        action_type: impl Into<String>,
        state: ActionState,
        now: DateTime<Utc>,
    ) -> Self {
        let queued = state.is_queued().then_some(now);
        Self {
            name: name.into(),
            action_type: action_type.into(),
            state,
            created: now,
            queued,
            start: None,
            stop: None,
            modified: now,
            error: None,
            filtered_cause: None,
        }
    }

    /// Marks the action complete.
    pub fn complete(&mut self, start: DateTime<Utc>, stop: DateTime<Utc>, now: DateTime<Utc>) {
        self.state = ActionState::Complete;
        self.start = Some(start);
        self.stop = Some(stop);
        self.modified = now;
    }

    /// Marks the action errored with the given detail.
    pub fn error(
        &mut self,
        error: ActionError,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
        now: DateTime<Utc>,
    ) {
        self.state = ActionState::Error;
        self.error = Some(error);
        self.start = Some(start);
        self.stop = Some(stop);
        self.modified = now;
    }

    /// Marks the action filtered out of the flow.
    pub fn filter(
        &mut self,
        cause: impl Into<String>,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
        now: DateTime<Utc>,
    ) {
        self.state = ActionState::Filtered;
        self.filtered_cause = Some(cause.into());
        self.start = Some(start);
        self.stop = Some(stop);
        self.modified = now;
    }

    /// Marks a previously errored attempt as retried.
    pub fn mark_retried(&mut self, now: DateTime<Utc>) {
        self.state = ActionState::Retried;
        self.modified = now;
    }

    /// Cancels the action.
    pub fn cancel(&mut self, now: DateTime<Utc>) {
        self.state = ActionState::Cancelled;
        self.modified = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(ActionState::Complete.is_terminal());
        assert!(ActionState::Error.is_terminal());
        assert!(ActionState::Filtered.is_terminal());
        assert!(!ActionState::Queued.is_terminal());
        assert!(!ActionState::InFlight.is_terminal());
    }

    #[test]
    fn queued_states() {
        assert!(ActionState::Queued.is_queued());
        assert!(ActionState::ColdQueued.is_queued());
        assert!(!ActionState::InFlight.is_queued());
    }

    #[test]
    fn valid_transitions() {
        assert!(ActionState::Queued.can_transition_to(ActionState::InFlight));
        assert!(ActionState::ColdQueued.can_transition_to(ActionState::Queued));
        assert!(ActionState::InFlight.can_transition_to(ActionState::Complete));
        assert!(ActionState::Error.can_transition_to(ActionState::Retried));
        assert!(!ActionState::Complete.can_transition_to(ActionState::Queued));
        assert!(!ActionState::Queued.can_transition_to(ActionState::Complete));
    }

    #[test]
    fn new_queued_action_records_queue_time() {
        let now = Utc::now();
        let action = Action::new("normalize", "transform", ActionState::Queued, now);
        assert_eq!(action.queued, Some(now));
        assert_eq!(action.state, ActionState::Queued);
    }

    #[test]
    fn complete_stamps_timestamps() {
        let now = Utc::now();
        let mut action = Action::new("normalize", "transform", ActionState::InFlight, now);
        assert!(action.queued.is_none());

        let later = now + chrono::Duration::seconds(2);
        action.complete(now, later, later);
        assert_eq!(action.state, ActionState::Complete);
        assert_eq!(action.stop, Some(later));
        assert_eq!(action.modified, later);
    }

    #[test]
    fn error_carries_detail() {
        let now = Utc::now();
        let mut action = Action::new("enrich", "enrich", ActionState::InFlight, now);
        action.error(
            ActionError::new("upstream 503").with_context("retried 3 times"),
            now,
            now,
            now,
        );
        assert_eq!(action.state, ActionState::Error);
        let err = action.error.as_ref().unwrap();
        assert_eq!(err.cause, "upstream 503");
        assert_eq!(err.context.as_deref(), Some("retried 3 times"));
    }

    #[test]
    fn serializes_with_camel_case_type_field() {
        let now = Utc::now();
        let action = Action::new("egress", "egress", ActionState::Queued, now);
        let json = serde_json::to_string(&action).unwrap();
        assert!(json.contains("\"type\":\"egress\""));
        assert!(json.contains("\"state\":\"QUEUED\""));
    }
}
