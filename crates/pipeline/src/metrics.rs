use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use tipoff_core::{Observer, ObserverError, TelemetryEvent, UnitStatus};

/// Per-unit execution statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UnitMetrics {
    /// Runs by unit name.
    pub runs: HashMap<String, u64>,
    /// Runs that did not end in `Success`, by unit name.
    pub failures: HashMap<String, u64>,
    /// Average run duration by unit name.
    pub avg_duration: HashMap<String, Duration>,
    pub last_run: HashMap<String, DateTime<Utc>>,
    /// Sources fetched, and how many of them changed.
    pub sources_fetched: u64,
    pub sources_changed: u64,
    /// Latest governor limit and delay seen on the bus.
    pub governor_limit: Option<usize>,
    pub governor_delay_ms: Option<u64>,
}

impl UnitMetrics {
    /// Record a unit execution.
    pub fn record_execution(&mut self, unit: &str, status: UnitStatus, duration: Duration) {
        *self.runs.entry(unit.to_string()).or_default() += 1;
        if status != UnitStatus::Success {
            *self.failures.entry(unit.to_string()).or_default() += 1;
        }
        self.last_run.insert(unit.to_string(), Utc::now());

        let count = self.runs[unit];
        let prev_avg = self.avg_duration.get(unit).copied().unwrap_or_default();

        // Incremental mean: new_avg = prev_avg + (duration - prev_avg) / count
        let new_avg = if count == 1 {
            duration
        } else {
            let prev_nanos = prev_avg.as_nanos() as f64;
            let cur_nanos = duration.as_nanos() as f64;
            let avg_nanos = prev_nanos + (cur_nanos - prev_nanos) / count as f64;
            Duration::from_nanos(avg_nanos as u64)
        };

        self.avg_duration.insert(unit.to_string(), new_avg);
    }
}

/// Bus observer that folds events into [`UnitMetrics`].
#[derive(Default)]
pub struct MetricsObserver {
    metrics: Mutex<UnitMetrics>,
}

impl MetricsObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> UnitMetrics {
        self.metrics.lock().map(|m| m.clone()).unwrap_or_default()
    }
}

impl Observer for MetricsObserver {
    fn name(&self) -> &str {
        "metrics"
    }

    fn on_event(&self, event: &TelemetryEvent) -> Result<(), ObserverError> {
        let mut m = self
            .metrics
            .lock()
            .map_err(|e| ObserverError(e.to_string()))?;
        match event {
            TelemetryEvent::UnitCompleted { unit, status, duration_ms } => {
                m.record_execution(unit, *status, Duration::from_millis(*duration_ms));
            }
            TelemetryEvent::SourceFetched { changed, .. } => {
                m.sources_fetched += 1;
                if *changed {
                    m.sources_changed += 1;
                }
            }
            TelemetryEvent::GovernorStateChanged { limit, delay_ms } => {
                m.governor_limit = Some(*limit);
                m.governor_delay_ms = Some(*delay_ms);
            }
            _ => {}
        }
        Ok(())
    }
}
