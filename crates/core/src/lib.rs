pub mod config;
pub mod error;
pub mod hash;
pub mod resolver;
pub mod telemetry;
pub mod types;

pub use config::{
    load_dotenv, CompositionConfig, EngineConfig, FetchConfig, GovernorConfig, NodeConfig,
    RetryConfig, SourceConfig, StorageConfig,
};
pub use error::*;
pub use hash::{fingerprint, fingerprint_parts};
pub use resolver::{ResolveError, Resolver};
pub use telemetry::{LogObserver, Observer, ObserverError, RecordingObserver, TelemetryBus, TelemetryEvent};
pub use types::*;
