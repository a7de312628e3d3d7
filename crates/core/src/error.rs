use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification shared by every error in the workspace.
///
/// The CLI reports this next to failing node/unit identifiers, and the
/// composition engine uses it to decide between retrying, skipping and aborting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network timeout or rate-limit response; retryable.
    Transient,
    /// Input rejected by a unit's validation predicate.
    Validation,
    /// Edge insertion would close a cycle.
    Cycle,
    /// Registry, sink or lineage store unavailable.
    Storage,
    /// A required capability was never registered.
    Unresolved,
    /// Non-retryable failure for one item.
    Terminal,
    /// The run was cancelled before the item started.
    Cancelled,
    /// Invalid configuration.
    Config,
}

impl ErrorKind {
    /// Whether an error of this kind aborts the enclosing run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ErrorKind::Storage | ErrorKind::Unresolved | ErrorKind::Config)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Validation => "validation",
            ErrorKind::Cycle => "cycle",
            ErrorKind::Storage => "storage",
            ErrorKind::Unresolved => "unresolved",
            ErrorKind::Terminal => "terminal",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Config => "config",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug)]
pub enum TipoffError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl TipoffError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TipoffError::Io(_) | TipoffError::Serialize(_) => ErrorKind::Storage,
            TipoffError::ConfigParse(_) | TipoffError::Config(_) => ErrorKind::Config,
            TipoffError::Other(_) => ErrorKind::Terminal,
        }
    }
}
