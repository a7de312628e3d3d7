//! Content registry: per-source fingerprints and processing status.
//!
//! The registry is the ground truth for change detection. Each record sits
//! behind its own mutex, so concurrent fetches for different sources never
//! contend on anything but the brief map lookup, and same-source updates
//! serialize.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use tipoff_core::{ProcessingStatus, SourceId, SourceRecord};

use crate::error::StorageError;

/// Outcome of registering a fetched payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRegistration {
    pub is_changed: bool,
    pub previous_hash: Option<String>,
}

/// Serializable registry state for the lineage store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub records: Vec<SourceRecord>,
}

type Slot = Arc<Mutex<SourceRecord>>;

#[derive(Default)]
pub struct ContentRegistry {
    records: RwLock<HashMap<SourceId, Slot>>,
}

impl ContentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a registry from a persisted snapshot.
    pub fn from_snapshot(snapshot: RegistrySnapshot) -> Self {
        let records = snapshot
            .records
            .into_iter()
            .map(|r| (r.source_id.clone(), Arc::new(Mutex::new(r))))
            .collect();
        Self {
            records: RwLock::new(records),
        }
    }

    fn slot(&self, source_id: &str) -> Result<Option<Slot>, StorageError> {
        let records = self
            .records
            .read()
            .map_err(|e| StorageError::LockPoisoned(format!("registry read lock: {e}")))?;
        Ok(records.get(source_id).cloned())
    }

    fn slot_or_insert(
        &self,
        source_id: &str,
        source_type: &str,
        hash: &str,
    ) -> Result<(Slot, bool), StorageError> {
        if let Some(slot) = self.slot(source_id)? {
            return Ok((slot, false));
        }
        let mut records = self
            .records
            .write()
            .map_err(|e| StorageError::LockPoisoned(format!("registry write lock: {e}")))?;
        let mut created = false;
        let slot = records
            .entry(source_id.to_string())
            .or_insert_with(|| {
                created = true;
                Arc::new(Mutex::new(SourceRecord::new(source_id, source_type, hash)))
            })
            .clone();
        Ok((slot, created))
    }

    /// Record a fetched payload fingerprint. Returns whether it differs from the
    /// previously stored fingerprint (always true for a first fetch).
    ///
    /// `last_processed_hash` is untouched; only [`ContentRegistry::commit_processed`]
    /// moves it.
    pub fn register_fetch(
        &self,
        source_id: &str,
        source_type: &str,
        payload_hash: &str,
    ) -> Result<bool, StorageError> {
        Ok(self
            .register_fetch_tracked(source_id, source_type, payload_hash)?
            .is_changed)
    }

    /// Like [`ContentRegistry::register_fetch`], also returning the replaced fingerprint.
    pub fn register_fetch_tracked(
        &self,
        source_id: &str,
        source_type: &str,
        payload_hash: &str,
    ) -> Result<FetchRegistration, StorageError> {
        let (slot, created) = self.slot_or_insert(source_id, source_type, payload_hash)?;
        if created {
            debug!(source_id, hash = payload_hash, "new source registered");
            return Ok(FetchRegistration {
                is_changed: true,
                previous_hash: None,
            });
        }

        let mut record = slot
            .lock()
            .map_err(|e| StorageError::LockPoisoned(format!("source record {source_id}: {e}")))?;
        let previous = record.content_hash.clone();
        let is_changed = previous != payload_hash;
        if is_changed {
            record.content_hash = payload_hash.to_string();
            record.ingested_at = Utc::now();
            record.processing_status = ProcessingStatus::Pending;
            debug!(source_id, old = %previous, new = payload_hash, "source content changed");
        }
        if record.source_type != source_type {
            record.source_type = source_type.to_string();
        }
        Ok(FetchRegistration {
            is_changed,
            previous_hash: Some(previous),
        })
    }

    /// Commit `hash` as processed for `source_id`.
    ///
    /// Compare-and-set: the commit only lands when `hash` is still the current
    /// content fingerprint. A newer fetch in between leaves the source dirty so
    /// a later run picks it up. Returns whether the commit landed.
    pub fn commit_processed(&self, source_id: &str, hash: &str) -> Result<bool, StorageError> {
        let Some(slot) = self.slot(source_id)? else {
            warn!(source_id, "commit for unknown source ignored");
            return Ok(false);
        };
        let mut record = slot
            .lock()
            .map_err(|e| StorageError::LockPoisoned(format!("source record {source_id}: {e}")))?;
        if record.content_hash != hash {
            debug!(
                source_id,
                committed = hash,
                current = %record.content_hash,
                "stale commit skipped, newer content pending"
            );
            return Ok(false);
        }
        record.last_processed_hash = Some(hash.to_string());
        record.processing_status = ProcessingStatus::Processed;
        Ok(true)
    }

    /// Mark the source as failed; it stays dirty.
    pub fn mark_failed(&self, source_id: &str) -> Result<(), StorageError> {
        if let Some(slot) = self.slot(source_id)? {
            let mut record = slot.lock().map_err(|e| {
                StorageError::LockPoisoned(format!("source record {source_id}: {e}"))
            })?;
            record.processing_status = ProcessingStatus::Failed;
        }
        Ok(())
    }

    /// Forget the committed fingerprint so the source is reprocessed even
    /// though its content did not change.
    pub fn invalidate(&self, source_id: &str) -> Result<bool, StorageError> {
        let Some(slot) = self.slot(source_id)? else {
            return Ok(false);
        };
        let mut record = slot
            .lock()
            .map_err(|e| StorageError::LockPoisoned(format!("source record {source_id}: {e}")))?;
        record.last_processed_hash = None;
        record.processing_status = ProcessingStatus::Pending;
        record.ingested_at = Utc::now();
        Ok(true)
    }

    /// `content_hash != last_processed_hash`. Unknown sources are not dirty.
    pub fn is_dirty(&self, source_id: &str) -> Result<bool, StorageError> {
        match self.get(source_id)? {
            Some(record) => Ok(record.is_dirty()),
            None => Ok(false),
        }
    }

    pub fn get(&self, source_id: &str) -> Result<Option<SourceRecord>, StorageError> {
        let Some(slot) = self.slot(source_id)? else {
            return Ok(None);
        };
        let record = slot
            .lock()
            .map_err(|e| StorageError::LockPoisoned(format!("source record {source_id}: {e}")))?;
        Ok(Some(record.clone()))
    }

    /// All records, optionally filtered by source type, sorted by source ID.
    pub fn list(&self, source_type: Option<&str>) -> Result<Vec<SourceRecord>, StorageError> {
        let slots: Vec<Slot> = {
            let records = self
                .records
                .read()
                .map_err(|e| StorageError::LockPoisoned(format!("registry read lock: {e}")))?;
            records.values().cloned().collect()
        };

        let mut out = Vec::with_capacity(slots.len());
        for slot in slots {
            let record = slot
                .lock()
                .map_err(|e| StorageError::LockPoisoned(format!("source record: {e}")))?;
            if source_type.map_or(true, |t| record.source_type == t) {
                out.push(record.clone());
            }
        }
        out.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        Ok(out)
    }

    /// Dirty source IDs, optionally filtered by type, sorted.
    pub fn list_dirty(&self, source_type: Option<&str>) -> Result<Vec<SourceId>, StorageError> {
        Ok(self
            .list(source_type)?
            .into_iter()
            .filter(|r| r.is_dirty())
            .map(|r| r.source_id)
            .collect())
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Result<RegistrySnapshot, StorageError> {
        Ok(RegistrySnapshot {
            records: self.list(None)?,
        })
    }
}
