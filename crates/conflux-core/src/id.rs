//! Strongly-typed identifiers for Conflux entities.
//!
//! All identifiers in Conflux are:
//! - **Strongly typed**: Prevents mixing up different ID types at compile time
//! - **Lexicographically sortable**: ULIDs encode creation time and sort naturally
//! - **Globally unique**: No coordination required for generation
//!
//! # Example
//!
//! ```rust
//! use conflux_core::Did;
//!
//! let did = Did::generate();
//! let parsed: Did = did.to_string().parse().unwrap();
//! assert_eq!(did, parsed);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

use crate::error::{Error, Result};

/// The durable unique identifier of a tracked data object (DeltaFile).
///
/// A did is assigned once at ingress or join aggregation and never changes
/// for the lifetime of the object. Parent/child lineage edges are expressed
/// as lists of dids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Did(Ulid);

impl Did {
    /// Generates a new unique did.
    ///
    /// Uses ULID generation which is:
    /// - Lexicographically sortable by creation time
    /// - Globally unique without coordination
    /// - URL-safe and case-insensitive
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Creates a did from a raw ULID.
    #[must_use]
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// Returns the underlying ULID.
    #[must_use]
    pub const fn as_ulid(&self) -> Ulid {
        self.0
    }

    /// Returns the creation timestamp encoded in the did.
    #[must_use]
    pub fn created_at(&self) -> chrono::DateTime<chrono::Utc> {
        let ms = self.0.timestamp_ms();
        chrono::DateTime::from_timestamp_millis(ms as i64).unwrap_or_else(chrono::Utc::now)
    }
}

impl fmt::Display for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Did {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ulid::from_string(s).map(Self).map_err(|e| Error::InvalidId {
            message: format!("invalid did '{s}': {e}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_is_unique() {
        let a = Did::generate();
        let b = Did::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn round_trips_through_string() {
        let did = Did::generate();
        let parsed: Did = did.to_string().parse().unwrap();
        assert_eq!(did, parsed);
    }

    #[test]
    fn rejects_garbage() {
        let result: Result<Did> = "not-a-ulid".parse();
        assert!(result.is_err());
    }

    #[test]
    fn serializes_transparently() {
        let did = Did::generate();
        let json = serde_json::to_string(&did).unwrap();
        assert_eq!(json, format!("\"{did}\""));
    }

    #[test]
    fn created_at_is_recent() {
        let did = Did::generate();
        let age = chrono::Utc::now() - did.created_at();
        assert!(age.num_seconds() < 60);
    }
}
