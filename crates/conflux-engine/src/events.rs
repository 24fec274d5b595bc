//! Inbound completion events from action workers.
//!
//! Workers report the outcome of each dispatched action back to the engine as
//! an [`ActionEvent`]. The orchestrator is the only consumer; every DeltaFile
//! mutation flows through one of these events.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use conflux_core::Did;

/// Outcome reported by a worker for one action execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum ActionEventResult {
    /// The action completed successfully.
    Complete {
        /// Metadata produced by the action, merged into downstream inputs.
        #[serde(default)]
        metadata: HashMap<String, String>,
    },
    /// The action failed.
    Error {
        /// Short cause, suitable for grouping.
        cause: String,
        /// Free-form diagnostics.
        #[serde(skip_serializing_if = "Option::is_none")]
        context: Option<String>,
    },
    /// The action filtered the object out of the flow.
    Filter {
        /// Why the object was filtered.
        cause: String,
    },
}

/// A completion event for one action on one DeltaFile.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionEvent {
    /// The DeltaFile the action ran against.
    pub did: Did,
    /// The owning flow's name.
    pub flow: String,
    /// The completing action's name.
    pub action: String,
    /// When the worker started executing.
    pub start: DateTime<Utc>,
    /// When the worker finished.
    pub stop: DateTime<Utc>,
    /// The reported outcome.
    pub result: ActionEventResult,
}

impl ActionEvent {
    /// Creates a successful completion event with no metadata.
    #[must_use]
    pub fn complete(
        did: Did,
        flow: impl Into<String>,
        action: impl Into<String>,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
    ) -> Self {
        Self {
            did,
            flow: flow.into(),
            action: action.into(),
            start,
            stop,
            result: ActionEventResult::Complete {
                metadata: HashMap::new(),
            },
        }
    }

    /// Creates an error event.
    #[must_use]
    pub fn error(
        did: Did,
        flow: impl Into<String>,
        action: impl Into<String>,
        cause: impl Into<String>,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
    ) -> Self {
        Self {
            did,
            flow: flow.into(),
            action: action.into(),
            start,
            stop,
            result: ActionEventResult::Error {
                cause: cause.into(),
                context: None,
            },
        }
    }

    /// Creates a filter event.
    #[must_use]
    pub fn filter(
        did: Did,
        flow: impl Into<String>,
        action: impl Into<String>,
        cause: impl Into<String>,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
    ) -> Self {
        Self {
            did,
            flow: flow.into(),
            action: action.into(),
            start,
            stop,
            result: ActionEventResult::Filter {
                cause: cause.into(),
            },
        }
    }
}
