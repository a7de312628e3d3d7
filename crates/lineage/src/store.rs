//! Lineage store: persistence of graph, registry and job audit trail.

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, warn};

use tipoff_core::JobRecord;

use crate::error::StorageError;
use crate::graph::GraphSnapshot;
use crate::registry::RegistrySnapshot;

/// Durable home of lineage state. Without a store the engine keeps
/// everything in memory.
pub trait LineageStore: Send + Sync {
    fn save_graph(&self, graph: &GraphSnapshot) -> Result<(), StorageError>;
    fn load_graph(&self) -> Result<Option<GraphSnapshot>, StorageError>;

    fn save_registry(&self, registry: &RegistrySnapshot) -> Result<(), StorageError>;
    fn load_registry(&self) -> Result<Option<RegistrySnapshot>, StorageError>;

    /// Append a sealed job record to the audit trail.
    fn append_job(&self, job: &JobRecord) -> Result<(), StorageError>;
    fn load_jobs(&self) -> Result<Vec<JobRecord>, StorageError>;
}

/// Filesystem-backed lineage persistence.
///
/// ```text
/// lineage/
///   graph.json      <- nodes in insertion order
///   registry.json   <- source records
///   jobs.jsonl      <- one sealed job record per line, append-only
/// ```
pub struct FsLineageStore {
    base_dir: PathBuf,
    // Serializes appends to jobs.jsonl.
    jobs_lock: Mutex<()>,
}

impl FsLineageStore {
    /// Create a store rooted at `base_dir`, creating the directory if needed.
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self {
            base_dir,
            jobs_lock: Mutex::new(()),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn write_json<T: serde::Serialize>(&self, name: &str, value: &T) -> Result<(), StorageError> {
        let json = serde_json::to_string_pretty(value)?;
        // Write-then-rename: readers never observe a truncated file.
        let tmp = self.base_dir.join(format!("{name}.tmp"));
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, self.base_dir.join(name))?;
        debug!(file = name, "lineage state saved");
        Ok(())
    }

    fn read_json<T: serde::de::DeserializeOwned>(&self, name: &str) -> Result<Option<T>, StorageError> {
        let path = self.base_dir.join(name);
        if !path.exists() {
            return Ok(None);
        }
        let json = std::fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&json)?))
    }
}

impl LineageStore for FsLineageStore {
    fn save_graph(&self, graph: &GraphSnapshot) -> Result<(), StorageError> {
        self.write_json("graph.json", graph)
    }

    fn load_graph(&self) -> Result<Option<GraphSnapshot>, StorageError> {
        self.read_json("graph.json")
    }

    fn save_registry(&self, registry: &RegistrySnapshot) -> Result<(), StorageError> {
        self.write_json("registry.json", registry)
    }

    fn load_registry(&self) -> Result<Option<RegistrySnapshot>, StorageError> {
        self.read_json("registry.json")
    }

    fn append_job(&self, job: &JobRecord) -> Result<(), StorageError> {
        let line = serde_json::to_string(job)?;
        let _guard = self
            .jobs_lock
            .lock()
            .map_err(|e| StorageError::LockPoisoned(format!("job log: {e}")))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.base_dir.join("jobs.jsonl"))?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    fn load_jobs(&self) -> Result<Vec<JobRecord>, StorageError> {
        let path = self.base_dir.join("jobs.jsonl");
        if !path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(std::fs::File::open(path)?);
        let mut jobs = Vec::new();
        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(job) => jobs.push(job),
                // A torn final line from an interrupted append is skipped.
                Err(e) => warn!(line = lineno + 1, error = %e, "skipping unreadable job record"),
            }
        }
        Ok(jobs)
    }
}

/// In-process store, mostly useful for tests and dry runs.
#[derive(Default)]
pub struct MemoryLineageStore {
    graph: Mutex<Option<GraphSnapshot>>,
    registry: Mutex<Option<RegistrySnapshot>>,
    jobs: Mutex<Vec<JobRecord>>,
}

impl MemoryLineageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<E: std::fmt::Display>(what: &str) -> impl FnOnce(E) -> StorageError + '_ {
    move |e| StorageError::LockPoisoned(format!("{what}: {e}"))
}

impl LineageStore for MemoryLineageStore {
    fn save_graph(&self, graph: &GraphSnapshot) -> Result<(), StorageError> {
        *self.graph.lock().map_err(poisoned("graph"))? = Some(graph.clone());
        Ok(())
    }

    fn load_graph(&self) -> Result<Option<GraphSnapshot>, StorageError> {
        Ok(self.graph.lock().map_err(poisoned("graph"))?.clone())
    }

    fn save_registry(&self, registry: &RegistrySnapshot) -> Result<(), StorageError> {
        *self.registry.lock().map_err(poisoned("registry"))? = Some(registry.clone());
        Ok(())
    }

    fn load_registry(&self) -> Result<Option<RegistrySnapshot>, StorageError> {
        Ok(self.registry.lock().map_err(poisoned("registry"))?.clone())
    }

    fn append_job(&self, job: &JobRecord) -> Result<(), StorageError> {
        self.jobs.lock().map_err(poisoned("jobs"))?.push(job.clone());
        Ok(())
    }

    fn load_jobs(&self) -> Result<Vec<JobRecord>, StorageError> {
        Ok(self.jobs.lock().map_err(poisoned("jobs"))?.clone())
    }
}
