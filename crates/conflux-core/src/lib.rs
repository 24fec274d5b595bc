//! # conflux-core
//!
//! Core abstractions for the Conflux data transformation platform.
//!
//! This crate provides the foundational types used across all Conflux
//! components:
//!
//! - **Identifiers**: Strongly-typed IDs for tracked data objects
//! - **Error Types**: Shared error definitions and result types
//!
//! ## Crate Boundary
//!
//! `conflux-core` is the **only** crate allowed to define shared primitives.
//! All cross-component interaction happens via contracts defined here or in
//! the engine crate built on top of it.
//!
//! ## Example
//!
//! ```rust
//! use conflux_core::Did;
//!
//! let did = Did::generate();
//! println!("tracking {did}");
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod id;

pub use error::{Error, Result};
pub use id::Did;
