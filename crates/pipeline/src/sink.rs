//! Content sinks: where raw payloads and derived artifacts land.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use tipoff_lineage::StorageError;

/// Describes a persisted payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadMetadata {
    /// Source type for raw payloads, node kind for derived artifacts.
    pub content_type: String,
    pub content_hash: String,
    pub written_at: DateTime<Utc>,
    #[serde(default)]
    pub size_bytes: usize,
    /// Job that produced the payload, when known.
    #[serde(default)]
    pub job_id: Option<String>,
}

impl PayloadMetadata {
    pub fn new(content_type: impl Into<String>, content_hash: impl Into<String>, size_bytes: usize) -> Self {
        Self {
            content_type: content_type.into(),
            content_hash: content_hash.into(),
            written_at: Utc::now(),
            size_bytes,
            job_id: None,
        }
    }

    pub fn with_job(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredPayload {
    pub payload: Bytes,
    pub metadata: PayloadMetadata,
}

/// Destination for fetched payloads and derived artifacts, keyed by
/// source or node ID.
pub trait ContentSink: Send + Sync {
    fn persist(&self, id: &str, payload: &Bytes, metadata: &PayloadMetadata) -> Result<(), StorageError>;

    /// The most recently persisted payload for `id`.
    fn read_latest(&self, id: &str) -> Result<Option<StoredPayload>, StorageError>;

    fn sink_name(&self) -> &str;
}

// ── Filesystem ────────────────────────────────────────────────

/// Filesystem sink. Payloads are content-addressed per ID:
///
/// ```text
/// raw/
///   scoreboard_s2024-01-01/
///     <hash>.bin    <- payload bytes
///     <hash>.json   <- metadata
///     latest        <- hash of the newest payload
/// ```
pub struct FsContentSink {
    base_dir: PathBuf,
}

impl FsContentSink {
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Directory for one ID. IDs are opaque, so anything that could act as
    /// a path component is escaped (reversibly, so distinct IDs never share
    /// a directory).
    fn dir_for(&self, id: &str) -> PathBuf {
        let mut escaped = String::with_capacity(id.len());
        for c in id.chars() {
            match c {
                '_' => escaped.push_str("__"),
                '/' => escaped.push_str("_s"),
                '\\' => escaped.push_str("_b"),
                ':' => escaped.push_str("_c"),
                '.' => escaped.push_str("_d"),
                c => escaped.push(c),
            }
        }
        self.base_dir.join(escaped)
    }
}

impl ContentSink for FsContentSink {
    fn persist(&self, id: &str, payload: &Bytes, metadata: &PayloadMetadata) -> Result<(), StorageError> {
        let dir = self.dir_for(id);
        std::fs::create_dir_all(&dir)?;
        let hash = &metadata.content_hash;

        std::fs::write(dir.join(format!("{hash}.bin")), payload)?;
        std::fs::write(
            dir.join(format!("{hash}.json")),
            serde_json::to_string_pretty(metadata)?,
        )?;
        // Pointer last: a reader following it always finds both files.
        let tmp = dir.join("latest.tmp");
        std::fs::write(&tmp, hash)?;
        std::fs::rename(&tmp, dir.join("latest"))?;

        debug!(id, hash = %hash, bytes = payload.len(), "payload persisted");
        Ok(())
    }

    fn read_latest(&self, id: &str) -> Result<Option<StoredPayload>, StorageError> {
        let dir = self.dir_for(id);
        let pointer = dir.join("latest");
        if !pointer.exists() {
            return Ok(None);
        }
        let hash = std::fs::read_to_string(pointer)?;
        let hash = hash.trim();
        let payload = std::fs::read(dir.join(format!("{hash}.bin")))?;
        let metadata = serde_json::from_str(&std::fs::read_to_string(dir.join(format!("{hash}.json")))?)?;
        Ok(Some(StoredPayload {
            payload: Bytes::from(payload),
            metadata,
        }))
    }

    fn sink_name(&self) -> &str {
        "fs"
    }
}

// ── Memory ────────────────────────────────────────────────────

/// Keeps only the latest payload per ID.
#[derive(Default)]
pub struct MemoryContentSink {
    entries: RwLock<HashMap<String, StoredPayload>>,
}

impl MemoryContentSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ContentSink for MemoryContentSink {
    fn persist(&self, id: &str, payload: &Bytes, metadata: &PayloadMetadata) -> Result<(), StorageError> {
        self.entries
            .write()
            .map_err(|e| StorageError::LockPoisoned(format!("memory sink: {e}")))?
            .insert(
                id.to_string(),
                StoredPayload {
                    payload: payload.clone(),
                    metadata: metadata.clone(),
                },
            );
        Ok(())
    }

    fn read_latest(&self, id: &str) -> Result<Option<StoredPayload>, StorageError> {
        Ok(self
            .entries
            .read()
            .map_err(|e| StorageError::LockPoisoned(format!("memory sink: {e}")))?
            .get(id)
            .cloned())
    }

    fn sink_name(&self) -> &str {
        "memory"
    }
}
