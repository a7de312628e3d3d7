//! Pipeline execution for tipoff: the unit lifecycle, sequential and graph
//! composition, content sinks, built-in units and the [`Engine`] entry points.

pub mod compose;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod sink;
pub mod unit;
pub mod units;

pub use compose::{CancelFlag, GraphComposition, GraphReport, NodeOutcome, Sequence, SequenceReport};
pub use engine::{Engine, EngineBuilder, IngestOptions, SourceFilter};
pub use error::{EngineError, UnitError};
pub use metrics::{MetricsObserver, UnitMetrics};
pub use sink::{ContentSink, FsContentSink, MemoryContentSink, PayloadMetadata, StoredPayload};
pub use unit::{run_unit, Artifact, FnUnit, PipelineUnit, UnitContext, UnitOutput, UnitRun, UnitState};
pub use units::{DigestUnit, IngestUnit};
