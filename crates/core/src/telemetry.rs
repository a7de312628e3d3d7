//! Telemetry bus: synchronous fan-out of lifecycle events to observers.
//!
//! Observers run one after another on the publishing thread. Each call is
//! isolated: an observer returning an error or panicking is logged and counted,
//! and neither the remaining observers nor the publisher are affected.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::types::{JobId, JobStatus, JobType, UnitStatus};

/// Events broadcast on the bus.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TelemetryEvent {
    UnitStarted {
        unit: String,
    },
    UnitCompleted {
        unit: String,
        status: UnitStatus,
        duration_ms: u64,
    },
    GraphDirtySetComputed {
        size: usize,
    },
    GovernorStateChanged {
        limit: usize,
        delay_ms: u64,
    },
    JobStarted {
        job_id: JobId,
        job_type: JobType,
    },
    JobFinished {
        job_id: JobId,
        status: JobStatus,
    },
    SourceFetched {
        source_id: String,
        changed: bool,
    },
}

impl TelemetryEvent {
    /// Short event name, used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            TelemetryEvent::UnitStarted { .. } => "unit_started",
            TelemetryEvent::UnitCompleted { .. } => "unit_completed",
            TelemetryEvent::GraphDirtySetComputed { .. } => "graph_dirty_set_computed",
            TelemetryEvent::GovernorStateChanged { .. } => "governor_state_changed",
            TelemetryEvent::JobStarted { .. } => "job_started",
            TelemetryEvent::JobFinished { .. } => "job_finished",
            TelemetryEvent::SourceFetched { .. } => "source_fetched",
        }
    }
}

#[derive(Debug, Error)]
#[error("observer error: {0}")]
pub struct ObserverError(pub String);

/// Receives events from the [`TelemetryBus`].
pub trait Observer: Send + Sync {
    /// Name used when logging observer failures.
    fn name(&self) -> &str;

    fn on_event(&self, event: &TelemetryEvent) -> Result<(), ObserverError>;
}

/// Broadcasts events to zero or more observers.
#[derive(Default)]
pub struct TelemetryBus {
    observers: RwLock<Vec<Arc<dyn Observer>>>,
    failures: AtomicU64,
    published: AtomicU64,
}

impl TelemetryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// A bus with the [`LogObserver`] already subscribed.
    pub fn with_logging() -> Self {
        let bus = Self::new();
        bus.subscribe(Arc::new(LogObserver));
        bus
    }

    pub fn subscribe(&self, observer: Arc<dyn Observer>) {
        debug!(observer = observer.name(), "observer subscribed");
        match self.observers.write() {
            Ok(mut obs) => obs.push(observer),
            Err(poisoned) => poisoned.into_inner().push(observer),
        }
    }

    /// Publish an event to every observer.
    pub fn publish(&self, event: TelemetryEvent) {
        self.published.fetch_add(1, Ordering::Relaxed);
        // Snapshot so observers may subscribe further observers without deadlocking.
        let observers: Vec<Arc<dyn Observer>> = match self.observers.read() {
            Ok(obs) => obs.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };

        for observer in observers {
            match catch_unwind(AssertUnwindSafe(|| observer.on_event(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    warn!(observer = observer.name(), event = event.name(), error = %e, "observer failed");
                }
                Err(_) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    error!(observer = observer.name(), event = event.name(), "observer panicked");
                }
            }
        }
    }

    pub fn observer_count(&self) -> usize {
        self.observers.read().map(|o| o.len()).unwrap_or(0)
    }

    /// Number of observer calls that errored or panicked.
    pub fn observer_failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

/// Writes every event through `tracing`.
pub struct LogObserver;

impl Observer for LogObserver {
    fn name(&self) -> &str {
        "log"
    }

    fn on_event(&self, event: &TelemetryEvent) -> Result<(), ObserverError> {
        match event {
            TelemetryEvent::UnitStarted { unit } => debug!(unit = %unit, "unit started"),
            TelemetryEvent::UnitCompleted { unit, status, duration_ms } => {
                debug!(unit = %unit, status = %status, duration_ms, "unit completed")
            }
            TelemetryEvent::GraphDirtySetComputed { size } => info!(size, "dirty set computed"),
            TelemetryEvent::GovernorStateChanged { limit, delay_ms } => {
                info!(limit, delay_ms, "governor state changed")
            }
            TelemetryEvent::JobStarted { job_id, job_type } => {
                info!(job_id = %job_id, job_type = %job_type, "job started")
            }
            TelemetryEvent::JobFinished { job_id, status } => {
                info!(job_id = %job_id, status = ?status, "job finished")
            }
            TelemetryEvent::SourceFetched { source_id, changed } => {
                debug!(source_id = %source_id, changed, "source fetched")
            }
        }
        Ok(())
    }
}

/// Collects events in memory.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events().iter().filter(|e| e.name() == name).count()
    }
}

impl Observer for RecordingObserver {
    fn name(&self) -> &str {
        "recording"
    }

    fn on_event(&self, event: &TelemetryEvent) -> Result<(), ObserverError> {
        self.events
            .lock()
            .map_err(|e| ObserverError(e.to_string()))?
            .push(event.clone());
        Ok(())
    }
}
