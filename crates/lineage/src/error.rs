use thiserror::Error;

use tipoff_core::ErrorKind;

/// Storage failures from the registry, the lineage store or a content sink.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("lock poisoned: {0}")]
    LockPoisoned(String),

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Errors from lineage graph and registry operations.
#[derive(Debug, Error)]
pub enum LineageError {
    #[error("cycle detected: {0}")]
    CycleDetected(String),

    #[error("unknown node: {0}")]
    UnknownNode(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl StorageError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Storage
    }
}

impl LineageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LineageError::CycleDetected(_) => ErrorKind::Cycle,
            LineageError::UnknownNode(_) => ErrorKind::Terminal,
            LineageError::Storage(_) => ErrorKind::Storage,
        }
    }
}
