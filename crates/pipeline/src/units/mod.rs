//! Built-in pipeline units.

pub mod digest;
pub mod ingest;

pub use digest::DigestUnit;
pub use ingest::IngestUnit;

/// Context parameter carrying the running job's ID.
pub const PARAM_JOB_ID: &str = "job_id";
