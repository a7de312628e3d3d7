use thiserror::Error;

use tipoff_core::ErrorKind;

use crate::client::FetchError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GovernorError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: FetchError },

    #[error("governor closed")]
    Closed,
}

impl GovernorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GovernorError::Fetch(e) => e.kind(),
            GovernorError::Exhausted { .. } => ErrorKind::Transient,
            GovernorError::Closed => ErrorKind::Cancelled,
        }
    }

    /// The underlying fetch error, if any.
    pub fn fetch_error(&self) -> Option<&FetchError> {
        match self {
            GovernorError::Fetch(e) | GovernorError::Exhausted { last: e, .. } => Some(e),
            GovernorError::Closed => None,
        }
    }
}
