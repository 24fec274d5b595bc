//! Flow advancement: applying one completion event to a DeltaFile.
//!
//! [`advance`] is the heart of the state machine. It validates that the
//! completing action is the flow's current head, records the outcome in the
//! action history and event log, and moves the flow (and, when warranted,
//! the whole DeltaFile) to its next state.
//!
//! Late results for cancelled work are discarded, never errored: a worker may
//! legitimately finish after a user cancels.

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::action::{Action, ActionError, ActionState};
use crate::delta_file::{DeltaFile, Stage};
use crate::dispatch::{ActionInvocation, FlowView};
use crate::error::{Error, Result};
use crate::events::{ActionEvent, ActionEventResult};
use crate::flow::{Flow, FlowEventKind, FlowState};
use crate::plan::{ActionConfiguration, FlowPlanSource};

/// What applying a completion event did to the DeltaFile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvanceOutcome {
    /// The next pending action was queued; the caller builds and enqueues its
    /// invocation.
    ActionQueued {
        /// The owning flow's name.
        flow: String,
        /// The queued action's name.
        action: String,
    },
    /// The flow completed; other flows are still in flight.
    FlowCompleted {
        /// The completed flow's name.
        flow: String,
    },
    /// The flow completed and it was the last one: the DeltaFile is COMPLETE.
    Completed,
    /// The flow errored; the DeltaFile stage is ERROR. No new invocation is
    /// dispatched for the flow.
    Errored {
        /// The errored flow's name.
        flow: String,
    },
    /// Late result for cancelled work; dropped without mutation.
    Discarded,
}

/// Applies one completion event to a DeltaFile.
///
/// # Errors
///
/// - [`Error::FlowNotFound`] when the event names an unknown flow.
/// - [`Error::Validation`] when the completing action is not the flow's
///   current dispatch-eligible head.
/// - [`Error::ActionConfigurationNotFound`] when a follow-on action has no
///   registered configuration.
pub fn advance(
    delta_file: &mut DeltaFile,
    event: &ActionEvent,
    plan: &dyn FlowPlanSource,
    now: DateTime<Utc>,
) -> Result<AdvanceOutcome> {
    if delta_file.is_cancelled() {
        warn!(did = %delta_file.did, action = %event.action, "discarding result for cancelled delta file");
        return Ok(AdvanceOutcome::Discarded);
    }

    let did = delta_file.did;
    let flow = delta_file
        .flow_mut(&event.flow)
        .ok_or_else(|| Error::FlowNotFound {
            did,
            flow: event.flow.clone(),
        })?;

    if flow.state == FlowState::Cancelled {
        warn!(%did, flow = %event.flow, action = %event.action, "discarding result for cancelled flow");
        return Ok(AdvanceOutcome::Discarded);
    }

    validate_head(flow, &event.action, did)?;

    let outcome = match &event.result {
        ActionEventResult::Complete { .. } => {
            complete_head(flow, event, plan, now)?
        }
        ActionEventResult::Error { cause, context } => {
            let mut error = ActionError::new(cause.clone());
            if let Some(context) = context {
                error = error.with_context(context.clone());
            }
            flow.record_error(error, event.start, event.stop, now);
            StepOutcome::Errored
        }
        ActionEventResult::Filter { cause } => {
            let action_name = event.action.clone();
            if let Some(action) = flow.head_action_mut() {
                action.filter(cause.clone(), event.start, event.stop, now);
            }
            flow.record_event(
                Some(action_name.as_str()),
                FlowEventKind::ActionFiltered {
                    cause: cause.clone(),
                },
                now,
            );
            // A filtered object leaves the flow; nothing further runs.
            flow.pending_actions.clear();
            flow.complete(now);
            StepOutcome::FlowDone
        }
    };

    delta_file.modified = now;
    delta_file.update_stage(now);

    Ok(match outcome {
        StepOutcome::Queued(action) => {
            debug!(%did, flow = %event.flow, action = %action, "queued next action");
            AdvanceOutcome::ActionQueued {
                flow: event.flow.clone(),
                action,
            }
        }
        StepOutcome::FlowDone => {
            if delta_file.stage == Stage::Complete {
                AdvanceOutcome::Completed
            } else {
                AdvanceOutcome::FlowCompleted {
                    flow: event.flow.clone(),
                }
            }
        }
        StepOutcome::Errored => AdvanceOutcome::Errored {
            flow: event.flow.clone(),
        },
    })
}

/// Assembles a self-contained invocation for one action on one DeltaFile.
///
/// The worker needs no further lookups: configuration, flow snapshot, target
/// did, and return address all travel together.
#[must_use]
pub fn build_action_input(
    config: ActionConfiguration,
    delta_file: &DeltaFile,
    flow: &Flow,
    return_address: impl Into<String>,
    system_name: impl Into<String>,
    now: DateTime<Utc>,
) -> ActionInvocation {
    ActionInvocation {
        action_config: config,
        flow: FlowView::from(flow),
        dids: vec![delta_file.did],
        aggregate_did: None,
        return_address: return_address.into(),
        system_name: system_name.into(),
        created: now,
    }
}

enum StepOutcome {
    Queued(String),
    FlowDone,
    Errored,
}

fn validate_head(flow: &Flow, action: &str, did: conflux_core::Did) -> Result<()> {
    match flow.head_action() {
        Some(head) if head.name == action => Ok(()),
        Some(head) => Err(Error::validation(format!(
            "action '{action}' is not the current head '{}' of flow '{}' on {did}",
            head.name, flow.name
        ))),
        None => Err(Error::validation(format!(
            "flow '{}' on {did} has no in-flight action to complete",
            flow.name
        ))),
    }
}

fn complete_head(
    flow: &mut Flow,
    event: &ActionEvent,
    plan: &dyn FlowPlanSource,
    now: DateTime<Utc>,
) -> Result<StepOutcome> {
    if let Some(action) = flow.head_action_mut() {
        action.complete(event.start, event.stop, now);
    }
    flow.record_event(Some(event.action.as_str()), FlowEventKind::ActionCompleted, now);

    match flow.take_next_pending() {
        Some(next) => {
            let config = plan.action_configuration(&flow.name, &next)?;
            flow.push_action(
                Action::new(&next, config.action_type, ActionState::Queued, now),
                now,
            );
            Ok(StepOutcome::Queued(next))
        }
        None => {
            flow.complete(now);
            Ok(StepOutcome::FlowDone)
        }
    }
}
