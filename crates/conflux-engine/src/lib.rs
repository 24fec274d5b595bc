//! # conflux-engine
//!
//! The DeltaFile execution engine for the Conflux data transformation
//! platform.
//!
//! This crate implements the core of the platform: the state machine that
//! tracks a data object's progress through one or more flows, the dispatch of
//! work to remote workers via a distributed queue, the fan-in join algorithm
//! that merges multiple objects into one synthetic aggregate, and the
//! write-back cache with optimistic concurrency that keeps in-flight state
//! consistent and crash-recoverable.
//!
//! ## Core Concepts
//!
//! - **DeltaFile**: A tracked data object moving through one or more flows
//! - **Flow**: A configured pipeline of actions applied to a DeltaFile
//! - **Action**: A pluggable processing step executed by an external worker
//! - **Join**: Fan-in of multiple DeltaFiles into one synthetic aggregate
//!
//! ## Guarantees
//!
//! - **Serialized mutation**: All in-process mutation of one DeltaFile is
//!   serialized by its per-did mutex
//! - **Optimistic versioning**: The durable store's compare-and-swap on
//!   version is the cross-instance correctness mechanism; a persisted
//!   mutation bumps the version by exactly one
//! - **Bounded fan-in**: Join depth is carried explicitly through chained
//!   joins and checked against policy before aggregation
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use conflux_engine::cache::build_cache;
//! use conflux_engine::config::EngineConfig;
//! use conflux_engine::dispatch::{DispatchClient, InstanceIdentity, QueueTransport};
//! use conflux_engine::dispatch::memory::InMemoryQueueTransport;
//! use conflux_engine::error::Result;
//! use conflux_engine::orchestrator::Orchestrator;
//! use conflux_engine::plan::StaticPlanSource;
//! use conflux_engine::store::memory::InMemoryDeltaFileStore;
//!
//! # fn main() -> Result<()> {
//! let config = EngineConfig::from_env()?;
//! let store = Arc::new(InMemoryDeltaFileStore::new());
//! let cache = build_cache(&config, store);
//! let transport: Arc<dyn QueueTransport> = Arc::new(InMemoryQueueTransport::new());
//! let dispatch = Arc::new(DispatchClient::new(
//!     transport,
//!     InstanceIdentity::generate(),
//!     config.queue_retry_attempts,
//!     config.cold_queue_threshold,
//! ));
//!
//! let orchestrator = Arc::new(Orchestrator::new(
//!     cache,
//!     Arc::new(StaticPlanSource::new()),
//!     dispatch,
//!     config,
//!     "conflux-prod",
//! ));
//! let _maintenance = Arc::clone(&orchestrator).start_cache_maintenance();
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod action;
pub mod advance;
pub mod cache;
pub mod config;
pub mod delta_file;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod flow;
pub mod join;
pub mod metrics;
pub mod mutex;
pub mod orchestrator;
pub mod plan;
pub mod store;

pub use action::{Action, ActionError, ActionState};
pub use advance::{advance, build_action_input, AdvanceOutcome};
pub use delta_file::{DeltaFile, Stage};
pub use error::{Error, Result};
pub use events::{ActionEvent, ActionEventResult};
pub use flow::{Flow, FlowEvent, FlowEventKind, FlowState};
pub use join::{create_aggregate_input, JoinDefinition, JoinEntry, JoinTracker};
pub use orchestrator::Orchestrator;
