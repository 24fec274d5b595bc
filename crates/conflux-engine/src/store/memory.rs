//! In-memory DeltaFile store for testing.
//!
//! This module provides [`InMemoryDeltaFileStore`], a simple in-memory
//! implementation of the [`DeltaFileStore`] trait suitable for testing and
//! single-node deployments.
//!
//! ## Limitations
//!
//! - **NOT suitable for production clusters**: No durability, no
//!   cross-process coordination
//! - **Single-process only**: State is lost when the process exits

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use conflux_core::Did;

use super::DeltaFileStore;
use crate::delta_file::DeltaFile;
use crate::error::{Error, Result};

/// In-memory store with CAS version discipline.
#[derive(Debug, Default)]
pub struct InMemoryDeltaFileStore {
    files: RwLock<HashMap<Did, DeltaFile>>,
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("delta file store lock poisoned")
}

impl InMemoryDeltaFileStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored DeltaFiles.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn count(&self) -> Result<usize> {
        let files = self.files.read().map_err(poison_err)?;
        Ok(files.len())
    }
}

#[async_trait]
impl DeltaFileStore for InMemoryDeltaFileStore {
    async fn insert_one(&self, delta_file: &DeltaFile) -> Result<()> {
        if delta_file.version != 0 {
            return Err(Error::validation(format!(
                "insert of {} requires version 0, got {}",
                delta_file.did, delta_file.version
            )));
        }
        let mut files = self.files.write().map_err(poison_err)?;
        if files.contains_key(&delta_file.did) {
            drop(files);
            return Err(Error::DuplicateKey {
                did: delta_file.did,
            });
        }
        let mut stored = delta_file.clone();
        stored.cache_time = None;
        stored.dirty = false;
        files.insert(stored.did, stored);
        drop(files);
        Ok(())
    }

    async fn save_and_flush(&self, delta_file: &DeltaFile) -> Result<u64> {
        let mut files = self.files.write().map_err(poison_err)?;
        let Some(existing) = files.get(&delta_file.did) else {
            drop(files);
            return Err(Error::DeltaFileNotFound {
                did: delta_file.did,
            });
        };
        if existing.version != delta_file.version {
            let expected = delta_file.version;
            drop(files);
            return Err(Error::OptimisticLock {
                did: delta_file.did,
                expected_version: expected,
            });
        }
        let mut stored = delta_file.clone();
        stored.version = delta_file.version + 1;
        stored.cache_time = None;
        stored.dirty = false;
        let new_version = stored.version;
        files.insert(stored.did, stored);
        drop(files);
        Ok(new_version)
    }

    async fn find_by_id(&self, did: Did) -> Result<Option<DeltaFile>> {
        let files = self.files.read().map_err(poison_err)?;
        Ok(files.get(&did).cloned())
    }

    async fn find_by_ids(&self, dids: &[Did]) -> Result<Vec<DeltaFile>> {
        let files = self.files.read().map_err(poison_err)?;
        Ok(dids.iter().filter_map(|did| files.get(did).cloned()).collect())
    }
}
