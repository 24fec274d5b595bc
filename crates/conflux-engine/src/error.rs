//! Error types for the DeltaFile execution engine.

use conflux_core::Did;

/// The result type used throughout conflux-engine.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in engine operations.
///
/// Only [`Error::OptimisticLock`] and [`Error::QueueUnavailable`] are retried
/// inside the engine; every other variant propagates to the caller.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A malformed invocation, event, or configuration was provided.
    #[error("validation failed: {message}")]
    Validation {
        /// Description of what failed validation.
        message: String,
    },

    /// A versioned save lost a compare-and-swap race.
    #[error("optimistic lock conflict for {did} at version {expected_version}")]
    OptimisticLock {
        /// The did whose save conflicted.
        did: Did,
        /// The version the writer expected to replace.
        expected_version: u64,
    },

    /// An insert collided with an existing did.
    #[error("duplicate key: did {did} already exists")]
    DuplicateKey {
        /// The did that already exists in the durable store.
        did: Did,
    },

    /// The dispatch queue transport is temporarily unreachable.
    #[error("queue unavailable: {queue}")]
    QueueUnavailable {
        /// The queue that could not be reached.
        queue: String,
        /// The underlying transport failure, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A join aggregation would exceed the configured depth bound.
    #[error("join depth {depth} for {did} exceeds maximum {max_depth}")]
    DepthExceeded {
        /// The aggregate did that was rejected.
        did: Did,
        /// The depth the aggregate would have had.
        depth: u32,
        /// The configured maximum depth.
        max_depth: u32,
    },

    /// The requested DeltaFile does not exist.
    #[error("delta file not found: {did}")]
    DeltaFileNotFound {
        /// The did that was looked up.
        did: Did,
    },

    /// The named flow does not exist on the DeltaFile.
    #[error("flow not found: {flow} on {did}")]
    FlowNotFound {
        /// The did that was inspected.
        did: Did,
        /// The flow name that was looked up.
        flow: String,
    },

    /// No action configuration is registered for a flow/action pair.
    #[error("action configuration not found: {flow}.{action}")]
    ActionConfigurationNotFound {
        /// The flow the action belongs to.
        flow: String,
        /// The action name that was looked up.
        action: String,
    },

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A serialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// An error from conflux-core.
    #[error("core error: {0}")]
    Core(#[from] conflux_core::Error),
}

impl Error {
    /// Creates a new validation error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Creates a new storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new queue-unavailable error without a source.
    #[must_use]
    pub fn queue_unavailable(queue: impl Into<String>) -> Self {
        Self::QueueUnavailable {
            queue: queue.into(),
            source: None,
        }
    }

    /// Returns true for transient errors the engine retries automatically.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::OptimisticLock { .. } | Self::QueueUnavailable { .. })
    }
}
