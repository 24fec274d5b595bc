//! Write-back cache: saves land in memory, a scheduled flush writes through.
//!
//! The map lock is held only briefly: flush and eviction snapshot dirty
//! entries under the lock, perform durable writes without it, then re-take it
//! to fold results back in. An entry re-saved while its snapshot was being
//! written stays dirty and is picked up by the next flush with the advanced
//! durable version.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;

use conflux_core::Did;

use super::DeltaFileCache;
use crate::delta_file::DeltaFile;
use crate::error::{Error, Result};
use crate::store::DeltaFileStore;

#[derive(Debug, Clone)]
struct CacheEntry {
    delta_file: DeltaFile,
    /// True until the entry's first durable write: flush must insert, not CAS.
    pending_insert: bool,
}

/// Cache variant that holds in-flight DeltaFiles in memory.
pub struct WriteBackCache {
    store: Arc<dyn DeltaFileStore>,
    entries: RwLock<HashMap<Did, CacheEntry>>,
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("delta file cache lock poisoned")
}

impl WriteBackCache {
    /// Creates a write-back cache over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn DeltaFileStore>) -> Self {
        Self {
            store,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the number of entries currently held.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn len(&self) -> Result<usize> {
        let entries = self.entries.read().map_err(poison_err)?;
        Ok(entries.len())
    }

    /// Returns true when no entries are held.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Writes one snapshot durably; returns the stored version.
    async fn write_through(&self, snapshot: &DeltaFile, pending_insert: bool) -> Result<u64> {
        if pending_insert {
            self.store.insert_one(snapshot).await?;
            Ok(snapshot.version)
        } else {
            self.store.save_and_flush(snapshot).await
        }
    }

    /// Folds a successful durable write back into the map.
    ///
    /// Keeps the entry dirty when it was re-saved after the snapshot was
    /// taken, so the newer state flushes next round against the advanced
    /// version.
    fn absorb_write(&self, snapshot: &DeltaFile, new_version: u64) -> Result<()> {
        let mut entries = self.entries.write().map_err(poison_err)?;
        if let Some(entry) = entries.get_mut(&snapshot.did) {
            entry.pending_insert = false;
            entry.delta_file.version = new_version;
            if entry.delta_file.modified == snapshot.modified {
                entry.delta_file.dirty = false;
            }
        }
        drop(entries);
        Ok(())
    }

    fn dirty_snapshots(&self) -> Result<Vec<(DeltaFile, bool)>> {
        let entries = self.entries.read().map_err(poison_err)?;
        Ok(entries
            .values()
            .filter(|e| e.delta_file.dirty)
            .map(|e| (e.delta_file.clone(), e.pending_insert))
            .collect())
    }

    #[cfg(test)]
    fn set_cache_time(&self, did: Did, at: DateTime<Utc>) {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = entries.get_mut(&did) {
            entry.delta_file.cache_time = Some(at);
        }
    }
}

#[async_trait]
impl DeltaFileCache for WriteBackCache {
    async fn get(&self, did: Did) -> Result<Option<DeltaFile>> {
        let now = Utc::now();
        {
            let mut entries = self.entries.write().map_err(poison_err)?;
            if let Some(entry) = entries.get_mut(&did) {
                entry.delta_file.cache_time = Some(now);
                return Ok(Some(entry.delta_file.clone()));
            }
        }

        let Some(mut loaded) = self.store.find_by_id(did).await? else {
            return Ok(None);
        };
        loaded.cache_time = Some(now);
        loaded.dirty = false;

        let mut entries = self.entries.write().map_err(poison_err)?;
        let entry = entries.entry(did).or_insert_with(|| CacheEntry {
            delta_file: loaded,
            pending_insert: false,
        });
        Ok(Some(entry.delta_file.clone()))
    }

    async fn get_many(&self, dids: &[Did]) -> Result<Vec<DeltaFile>> {
        let mut found = Vec::with_capacity(dids.len());
        for did in dids {
            if let Some(delta_file) = self.get(*did).await? {
                found.push(delta_file);
            }
        }
        Ok(found)
    }

    async fn is_cached(&self, did: Did) -> bool {
        let entries = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        entries.contains_key(&did)
    }

    async fn save(&self, delta_file: &mut DeltaFile) -> Result<()> {
        let now = Utc::now();
        let mut entries = self.entries.write().map_err(poison_err)?;

        let pending_insert = match entries.get(&delta_file.did) {
            Some(entry) => entry.pending_insert,
            None => delta_file.version == 0 && delta_file.cache_time.is_none(),
        };
        // A concurrent flush may have advanced the durable version past the
        // caller's copy; the CAS chain must continue from the stored one.
        if let Some(entry) = entries.get(&delta_file.did) {
            if entry.delta_file.version > delta_file.version {
                delta_file.version = entry.delta_file.version;
            }
        }

        delta_file.cache_time = Some(now);
        delta_file.dirty = true;
        entries.insert(
            delta_file.did,
            CacheEntry {
                delta_file: delta_file.clone(),
                pending_insert,
            },
        );
        drop(entries);
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
        let mut first_err: Option<Error> = None;
        for (snapshot, pending_insert) in self.dirty_snapshots()? {
            match self.write_through(&snapshot, pending_insert).await {
                Ok(new_version) => self.absorb_write(&snapshot, new_version)?,
                Err(err) => {
                    warn!(did = %snapshot.did, error = %err, "cache flush failed for entry");
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    async fn remove_older_than(&self, age: Duration, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now
            - chrono::Duration::from_std(age)
                .map_err(|e| Error::validation(format!("eviction age out of range: {e}")))?;

        let stale: Vec<(DeltaFile, bool)> = {
            let entries = self.entries.read().map_err(poison_err)?;
            entries
                .values()
                .filter(|e| e.delta_file.cache_time.is_some_and(|t| t <= cutoff))
                .map(|e| (e.delta_file.clone(), e.pending_insert))
                .collect()
        };

        let mut first_err: Option<Error> = None;
        let mut evictable = Vec::new();
        for (snapshot, pending_insert) in stale {
            if snapshot.dirty {
                match self.write_through(&snapshot, pending_insert).await {
                    Ok(new_version) => {
                        self.absorb_write(&snapshot, new_version)?;
                        evictable.push((snapshot.did, snapshot.modified));
                    }
                    Err(err) => {
                        warn!(did = %snapshot.did, error = %err, "eviction flush failed, retaining entry");
                        if first_err.is_none() {
                            first_err = Some(err);
                        }
                    }
                }
            } else {
                evictable.push((snapshot.did, snapshot.modified));
            }
        }

        let mut evicted = 0;
        {
            let mut entries = self.entries.write().map_err(poison_err)?;
            for (did, modified) in evictable {
                // Retouched or re-saved entries stay.
                let still_stale = entries.get(&did).is_some_and(|e| {
                    e.delta_file.modified == modified
                        && e.delta_file.cache_time.is_some_and(|t| t <= cutoff)
                });
                if still_stale {
                    entries.remove(&did);
                    evicted += 1;
                }
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(evicted),
        }
    }

    async fn evict(&self, did: Did) {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        entries.remove(&did);
    }
}
