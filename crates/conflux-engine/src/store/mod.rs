//! Durable storage for DeltaFiles.
//!
//! The [`DeltaFileStore`] trait defines the persistence layer the cache
//! writes through. Implementations must provide:
//!
//! - **Insert-once semantics**: a did can be inserted exactly once
//! - **CAS semantics**: updates compare the stored version and bump it by
//!   exactly one, which is the cross-instance correctness mechanism
//! - **Testability**: an in-memory implementation ships for tests and
//!   single-node deployments

pub mod memory;

use async_trait::async_trait;

use conflux_core::Did;

use crate::delta_file::DeltaFile;
use crate::error::Result;

/// Storage abstraction for DeltaFiles.
///
/// ## Version Discipline
///
/// `save_and_flush` is the core primitive for distributed correctness: the
/// write succeeds only when the caller's `version` matches the stored one,
/// and the stored version is then incremented by exactly one. Racing writers
/// observe [`crate::error::Error::OptimisticLock`] and must reload before
/// retrying.
#[async_trait]
pub trait DeltaFileStore: Send + Sync {
    /// Inserts a new DeltaFile.
    ///
    /// # Errors
    ///
    /// - [`crate::error::Error::DuplicateKey`] when the did already exists.
    /// - [`crate::error::Error::Validation`] when the object carries a
    ///   non-zero version (it was persisted before).
    async fn insert_one(&self, delta_file: &DeltaFile) -> Result<()>;

    /// Compare-and-swap update on version.
    ///
    /// Returns the new stored version (caller's version + 1).
    ///
    /// # Errors
    ///
    /// - [`crate::error::Error::OptimisticLock`] when the stored version does
    ///   not match the caller's.
    /// - [`crate::error::Error::DeltaFileNotFound`] when the did was never
    ///   inserted.
    async fn save_and_flush(&self, delta_file: &DeltaFile) -> Result<u64>;

    /// Gets a DeltaFile by did.
    ///
    /// Returns `None` when the did does not exist.
    async fn find_by_id(&self, did: Did) -> Result<Option<DeltaFile>>;

    /// Gets the DeltaFiles for the given dids, skipping unknown ones.
    async fn find_by_ids(&self, dids: &[Did]) -> Result<Vec<DeltaFile>>;
}
