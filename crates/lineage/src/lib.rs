//! Change tracking for the tipoff engine: the content registry, the lineage
//! graph and their persistence.

pub mod error;
pub mod graph;
pub mod registry;
pub mod store;

pub use error::{LineageError, StorageError};
pub use graph::{GraphSnapshot, LineageGraph};
pub use registry::{ContentRegistry, FetchRegistration, RegistrySnapshot};
pub use store::{FsLineageStore, LineageStore, MemoryLineageStore};
