//! Flow configuration lookup.
//!
//! Flow plans are authored, validated, and hot-reloaded outside the engine.
//! The engine consumes them through [`FlowPlanSource`], which resolves the
//! configuration of a single action within a flow. A static in-memory source
//! is provided for tests and embedded deployments.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::join::JoinDefinition;

/// Configuration of one action within a flow plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionConfiguration {
    /// Action name, unique within its flow.
    pub name: String,
    /// Action type; names the dispatch queue the worker listens on.
    #[serde(rename = "type")]
    pub action_type: String,
    /// Plan-supplied parameters, passed verbatim to the worker.
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
    /// Join definition; present when this action fans in multiple objects.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub join: Option<JoinDefinition>,
}

impl ActionConfiguration {
    /// Creates a plain (non-joining) action configuration.
    #[must_use]
    pub fn new(name: impl Into<String>, action_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            action_type: action_type.into(),
            parameters: serde_json::Map::new(),
            join: None,
        }
    }

    /// Attaches a join definition.
    #[must_use]
    pub fn with_join(mut self, join: JoinDefinition) -> Self {
        self.join = Some(join);
        self
    }
}

/// Resolves action configurations by flow and action name.
///
/// Implemented by the flow-plan subsystem in production; the engine only
/// reads through this seam.
pub trait FlowPlanSource: Send + Sync {
    /// Resolves the configuration for `action` within `flow`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ActionConfigurationNotFound`] when the pair is not
    /// registered.
    fn action_configuration(&self, flow: &str, action: &str) -> Result<ActionConfiguration>;
}

/// Static, in-memory plan source for tests and embedded deployments.
#[derive(Debug, Default)]
pub struct StaticPlanSource {
    configs: RwLock<HashMap<(String, String), ActionConfiguration>>,
}

impl StaticPlanSource {
    /// Creates an empty plan source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an action configuration under the given flow.
    pub fn register(&self, flow: impl Into<String>, config: ActionConfiguration) {
        let mut configs = self
            .configs
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        configs.insert((flow.into(), config.name.clone()), config);
    }
}

impl FlowPlanSource for StaticPlanSource {
    fn action_configuration(&self, flow: &str, action: &str) -> Result<ActionConfiguration> {
        let configs = self
            .configs
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        configs
            .get(&(flow.to_owned(), action.to_owned()))
            .cloned()
            .ok_or_else(|| Error::ActionConfigurationNotFound {
                flow: flow.to_owned(),
                action: action.to_owned(),
            })
    }
}
