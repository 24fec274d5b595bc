//! In-flight DeltaFile caching.
//!
//! One capability set, two selectable implementations chosen by deployment
//! configuration:
//!
//! - [`PassThroughCache`]: every operation hits the durable store
//! - [`WriteBackCache`]: saves land in an in-memory map first; a scheduled
//!   flush writes dirty entries through
//!
//! ## Save Semantics
//!
//! `save` decides insert-versus-update once, at save time: a version-0 object
//! with no prior cache timestamp has never been persisted and is inserted;
//! anything else is a compare-and-swap update on version. Failures always
//! propagate; the orchestrator owns reload-and-retry on
//! [`crate::error::Error::OptimisticLock`].

pub mod pass_through;
pub mod write_back;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use conflux_core::Did;

use crate::config::{CacheVariant, EngineConfig};
use crate::delta_file::DeltaFile;
use crate::error::{Error, Result};
use crate::store::DeltaFileStore;

pub use pass_through::PassThroughCache;
pub use write_back::WriteBackCache;

/// Cache over the durable DeltaFile store.
#[async_trait]
pub trait DeltaFileCache: Send + Sync {
    /// Gets a DeltaFile, cache-first.
    async fn get(&self, did: Did) -> Result<Option<DeltaFile>>;

    /// Gets several DeltaFiles, cache-first, skipping unknown dids.
    async fn get_many(&self, dids: &[Did]) -> Result<Vec<DeltaFile>>;

    /// Returns true when the did is held in memory.
    async fn is_cached(&self, did: Did) -> bool;

    /// Saves a DeltaFile.
    ///
    /// Version 0 with no prior cache timestamp inserts; anything else updates
    /// via compare-and-swap on version. The object's version and cache
    /// metadata are updated in place.
    ///
    /// # Errors
    ///
    /// - [`Error::DuplicateKey`] on insert collision.
    /// - [`Error::OptimisticLock`] on version mismatch.
    async fn save(&self, delta_file: &mut DeltaFile) -> Result<()>;

    /// Saves several DeltaFiles, best effort per element.
    ///
    /// One element's failure never blocks independent others. Returns the
    /// failures paired with their dids; empty means every save succeeded.
    async fn save_all(&self, delta_files: &mut [DeltaFile]) -> Vec<(Did, Error)>;

    /// Forces dirty entries to durable storage.
    ///
    /// No-op for pass-through. Called on shutdown and on the configured
    /// schedule.
    ///
    /// # Errors
    ///
    /// Returns the first flush failure after attempting every dirty entry.
    async fn flush(&self) -> Result<()>;

    /// Evicts entries whose last touch is older than `age`, flushing dirty
    /// ones first. Returns the number of entries evicted.
    ///
    /// No-op for pass-through.
    ///
    /// # Errors
    ///
    /// Returns a storage error when flushing an evicted entry fails; the
    /// entry is then retained.
    async fn remove_older_than(&self, age: Duration, now: DateTime<Utc>) -> Result<usize>;

    /// Drops the in-memory copy of a did so the next get reloads from the
    /// durable store. Used after an optimistic-lock conflict.
    async fn evict(&self, did: Did);
}

/// Builds the cache variant the deployment configuration selects.
#[must_use]
pub fn build_cache(
    config: &EngineConfig,
    store: Arc<dyn DeltaFileStore>,
) -> Arc<dyn DeltaFileCache> {
    match config.cache_variant {
        CacheVariant::PassThrough => Arc::new(PassThroughCache::new(store)),
        CacheVariant::WriteBack => Arc::new(WriteBackCache::new(store)),
    }
}
