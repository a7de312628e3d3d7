use thiserror::Error;

use tipoff_core::{ErrorKind, ResolveError, TipoffError};
use tipoff_governor::GovernorError;
use tipoff_lineage::{LineageError, StorageError};

/// Failure of one pipeline unit.
#[derive(Debug, Error)]
pub enum UnitError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("execution failed: {0}")]
    Execution(String),

    #[error("fetch failed: {0}")]
    Fetch(#[from] GovernorError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("lineage error: {0}")]
    Lineage(#[from] LineageError),

    #[error(transparent)]
    Unresolved(#[from] ResolveError),

    #[error("unit {unit} failed ({kind}): {message}")]
    ComponentFailed {
        unit: String,
        kind: ErrorKind,
        message: String,
    },

    #[error("unit panicked: {0}")]
    Panicked(String),

    #[error("cancelled before start")]
    Cancelled,
}

impl UnitError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            UnitError::Validation(_) => ErrorKind::Validation,
            UnitError::Execution(_) | UnitError::Panicked(_) => ErrorKind::Terminal,
            UnitError::Fetch(e) => e.kind(),
            UnitError::Storage(_) => ErrorKind::Storage,
            UnitError::Lineage(e) => e.kind(),
            UnitError::Unresolved(e) => e.kind(),
            UnitError::ComponentFailed { kind, .. } => *kind,
            UnitError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

/// Errors that abort an engine operation as a whole.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(#[from] TipoffError),

    #[error(transparent)]
    Unresolved(#[from] ResolveError),

    #[error("lineage error: {0}")]
    Lineage(#[from] LineageError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("no unit bound to node {0}")]
    UnboundNode(String),

    #[error("unit error: {0}")]
    Unit(#[from] UnitError),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Config(e) => e.kind(),
            EngineError::Unresolved(e) => e.kind(),
            EngineError::Lineage(e) => e.kind(),
            EngineError::Storage(_) => ErrorKind::Storage,
            EngineError::UnboundNode(_) => ErrorKind::Unresolved,
            EngineError::Unit(e) => e.kind(),
        }
    }
}
