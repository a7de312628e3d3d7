use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable key of an ingested source unit (e.g. endpoint + partition).
pub type SourceId = String;

/// Identifier of a derived lineage node. Opaque: no naming convention is assumed.
pub type NodeId = String;

/// Unique identifier of a job execution.
pub type JobId = Uuid;

// ── Sources ───────────────────────────────────────────────────

/// Processing status of a source unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessingStatus {
    Pending,
    Processed,
    Failed,
}

/// One ingested raw unit, tracked by the content registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub source_id: SourceId,
    pub source_type: String,
    /// Fingerprint of the most recently fetched payload.
    pub content_hash: String,
    pub ingested_at: DateTime<Utc>,
    /// Fingerprint committed by the last successful downstream processing.
    pub last_processed_hash: Option<String>,
    pub processing_status: ProcessingStatus,
}

impl SourceRecord {
    pub fn new(source_id: impl Into<SourceId>, source_type: impl Into<String>, hash: &str) -> Self {
        Self {
            source_id: source_id.into(),
            source_type: source_type.into(),
            content_hash: hash.to_string(),
            ingested_at: Utc::now(),
            last_processed_hash: None,
            processing_status: ProcessingStatus::Pending,
        }
    }

    /// A source is dirty while its latest content has not been committed downstream.
    pub fn is_dirty(&self) -> bool {
        self.last_processed_hash.as_deref() != Some(self.content_hash.as_str())
    }
}

// ── Lineage nodes ─────────────────────────────────────────────

/// Tier of a derived artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// Tier 1: entity derived from raw sources.
    Entity,
    /// Tier 2: feature derived from entities or other features.
    Feature,
    /// Tier 3: model consuming features.
    Model,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::Entity => write!(f, "entity"),
            NodeKind::Feature => write!(f, "feature"),
            NodeKind::Model => write!(f, "model"),
        }
    }
}

/// A derived artifact in the lineage graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineageNode {
    pub node_id: NodeId,
    pub node_kind: NodeKind,
    /// Upstream node or source IDs, in declaration order, without duplicates.
    pub depends_on: Vec<String>,
    pub last_computed_at: Option<DateTime<Utc>>,
    pub generator_version: u32,
    /// Generator version that produced the current artifact.
    #[serde(default)]
    pub computed_version: Option<u32>,
}

impl LineageNode {
    pub fn new(node_id: impl Into<NodeId>, node_kind: NodeKind, depends_on: Vec<String>) -> Self {
        let mut deps: Vec<String> = Vec::with_capacity(depends_on.len());
        for dep in depends_on {
            if !deps.contains(&dep) {
                deps.push(dep);
            }
        }
        Self {
            node_id: node_id.into(),
            node_kind,
            depends_on: deps,
            last_computed_at: None,
            generator_version: 1,
            computed_version: None,
        }
    }

    pub fn with_generator_version(mut self, version: u32) -> Self {
        self.generator_version = version;
        self
    }
}

/// Outcome status of one pipeline unit execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnitStatus {
    Success,
    ValidationFailed,
    ExecutionError,
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitStatus::Success => write!(f, "success"),
            UnitStatus::ValidationFailed => write!(f, "validation_failed"),
            UnitStatus::ExecutionError => write!(f, "execution_error"),
        }
    }
}

/// Transient result of a dirty scan for one changed source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub source_id: SourceId,
    pub old_hash: Option<String>,
    pub new_hash: String,
    /// Downstream closure in topological order.
    pub affected_node_ids: Vec<NodeId>,
}

// ── Jobs ──────────────────────────────────────────────────────

/// What kind of run produced a job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Ingest,
    Recompute,
    Full,
    Sequence,
    Graph,
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobType::Ingest => "ingest",
            JobType::Recompute => "recompute",
            JobType::Full => "full",
            JobType::Sequence => "sequence",
            JobType::Graph => "graph",
        };
        f.write_str(s)
    }
}

/// Final status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Success,
    Failed,
    PartialFailure,
}

/// One execution of a pipeline unit or composition. Write-once after sealing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub job_type: JobType,
    pub input_source_ids: Vec<SourceId>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: Option<JobStatus>,
    pub error_summary: Option<String>,
    /// Nodes executed by this job (empty for pure ingest jobs).
    #[serde(default)]
    pub executed_nodes: Vec<NodeId>,
    /// Failing node or unit identifiers with their classified error kind.
    #[serde(default)]
    pub failures: Vec<FailureEntry>,
    #[serde(default)]
    pub changes: Vec<ChangeRecord>,
}

/// A failing node/unit identifier with the classified error kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureEntry {
    pub id: String,
    pub kind: String,
    pub message: String,
}

impl JobRecord {
    /// Open a new job record; `status` stays empty until [`JobRecord::seal`].
    pub fn start(job_type: JobType, input_source_ids: Vec<SourceId>) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            job_type,
            input_source_ids,
            started_at: Utc::now(),
            ended_at: None,
            status: None,
            error_summary: None,
            executed_nodes: Vec::new(),
            failures: Vec::new(),
            changes: Vec::new(),
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.status.is_some()
    }

    /// Seal the record. A sealed record is never modified again; later calls are ignored.
    pub fn seal(&mut self, status: JobStatus, error_summary: Option<String>) {
        if self.is_sealed() {
            return;
        }
        self.ended_at = Some(Utc::now());
        self.status = Some(status);
        self.error_summary = error_summary;
    }

    pub fn record_failure(&mut self, id: &str, kind: &str, message: &str) {
        if self.is_sealed() {
            return;
        }
        self.failures.push(FailureEntry {
            id: id.to_string(),
            kind: kind.to_string(),
            message: message.to_string(),
        });
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.ended_at
            .map(|end| end.signed_duration_since(self.started_at).num_milliseconds())
    }
}
