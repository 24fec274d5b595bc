//! Pass-through cache: every operation hits the durable store.
//!
//! Used by deployments that prefer durable-store consistency over in-memory
//! latency, and as the fallback while the write-back cache is disabled.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use conflux_core::Did;

use super::DeltaFileCache;
use crate::delta_file::DeltaFile;
use crate::error::{Error, Result};
use crate::store::DeltaFileStore;

/// Cache variant that always reads and writes the durable store.
pub struct PassThroughCache {
    store: Arc<dyn DeltaFileStore>,
}

impl PassThroughCache {
    /// Creates a pass-through cache over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn DeltaFileStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl DeltaFileCache for PassThroughCache {
    async fn get(&self, did: Did) -> Result<Option<DeltaFile>> {
        let now = Utc::now();
        Ok(self.store.find_by_id(did).await?.map(|mut delta_file| {
            // The touch marks the object as previously persisted, so a later
            // save of a version-0 object takes the CAS path, not insert.
            delta_file.touch(now);
            delta_file
        }))
    }

    async fn get_many(&self, dids: &[Did]) -> Result<Vec<DeltaFile>> {
        let now = Utc::now();
        let mut found = self.store.find_by_ids(dids).await?;
        for delta_file in &mut found {
            delta_file.touch(now);
        }
        Ok(found)
    }

    async fn is_cached(&self, _did: Did) -> bool {
        false
    }

    async fn save(&self, delta_file: &mut DeltaFile) -> Result<()> {
        let now = Utc::now();
        if delta_file.version == 0 && delta_file.cache_time.is_none() {
            self.store.insert_one(delta_file).await?;
        } else {
            delta_file.version = self.store.save_and_flush(delta_file).await?;
        }
        delta_file.cache_time = Some(now);
        delta_file.dirty = false;
        Ok(())
    }

    async fn save_all(&self, delta_files: &mut [DeltaFile]) -> Vec<(Did, Error)> {
        let mut failures = Vec::new();
        for delta_file in delta_files.iter_mut() {
            if let Err(err) = self.save(delta_file).await {
                failures.push((delta_file.did, err));
            }
        }
        failures
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    async fn remove_older_than(&self, _age: Duration, _now: DateTime<Utc>) -> Result<usize> {
        Ok(0)
    }

    async fn evict(&self, _did: Did) {}
}
