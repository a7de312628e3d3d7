//! Composition of pipeline units: sequential chains and dependency graphs.
//! Both are themselves [`PipelineUnit`](crate::unit::PipelineUnit)s, so they
//! nest freely.

pub mod graph;
pub mod sequence;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub use graph::{GraphComposition, GraphReport, NodeOutcome};
pub use sequence::{Sequence, SequenceReport};

/// Cooperative cancellation: in-flight work finishes, nothing new starts.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests;
