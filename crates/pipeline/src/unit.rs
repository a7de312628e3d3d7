//! Pipeline unit contract and lifecycle.
//!
//! Every unit goes through the same lifecycle, driven by [`run_unit`]:
//!
//! ```text
//! Created -> Validating -> Executing -> Completed -> CleanedUp
//!                      \-> Failed ----------------> CleanedUp
//!                          Executing -> Errored --> CleanedUp
//! ```
//!
//! Validation is a pure predicate on the input context. Side effects belong
//! in `execute` only. Cleanup always runs, and its errors are logged, never
//! propagated.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use tipoff_core::{TelemetryBus, TelemetryEvent, UnitStatus};

use crate::error::UnitError;

// ── Artifacts and context ─────────────────────────────────────

/// Something a unit produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Artifact {
    Bytes(Bytes),
    Json(serde_json::Value),
}

impl Artifact {
    /// Canonical byte form, used for fingerprinting and persistence.
    pub fn to_bytes(&self) -> Bytes {
        match self {
            Artifact::Bytes(b) => b.clone(),
            Artifact::Json(v) => Bytes::from(v.to_string()),
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Artifact::Json(v) => Some(v),
            Artifact::Bytes(_) => None,
        }
    }
}

/// Input handed to a unit: upstream artifacts keyed by producer plus run
/// parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnitContext {
    inputs: BTreeMap<String, Artifact>,
    params: BTreeMap<String, String>,
}

impl UnitContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_input(mut self, key: impl Into<String>, artifact: Artifact) -> Self {
        self.inputs.insert(key.into(), artifact);
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn input(&self, key: &str) -> Option<&Artifact> {
        self.inputs.get(key)
    }

    pub fn inputs(&self) -> &BTreeMap<String, Artifact> {
        &self.inputs
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    /// Merge a unit's artifacts into this context, later values winning.
    pub fn merge(&mut self, output: &UnitOutput) {
        for (key, artifact) in &output.artifacts {
            self.inputs.insert(key.clone(), artifact.clone());
        }
    }

    /// Same parameters, no inputs.
    pub fn params_only(&self) -> Self {
        Self {
            inputs: BTreeMap::new(),
            params: self.params.clone(),
        }
    }
}

/// What a successful execution returns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnitOutput {
    pub artifacts: BTreeMap<String, Artifact>,
    pub metadata: BTreeMap<String, String>,
}

impl UnitOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_artifact(mut self, key: impl Into<String>, artifact: Artifact) -> Self {
        self.artifacts.insert(key.into(), artifact);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Fold another output into this one, later values winning.
    pub fn absorb(&mut self, other: UnitOutput) {
        self.artifacts.extend(other.artifacts);
        self.metadata.extend(other.metadata);
    }
}

// ── Contract ──────────────────────────────────────────────────

/// A pipeline step. Dependencies are injected at construction and stay
/// fixed for the unit's lifetime.
pub trait PipelineUnit: Send + Sync {
    fn name(&self) -> &str;

    /// Pure predicate on the input. An error means the input is rejected
    /// and `execute` is not called.
    fn validate(&self, _ctx: &UnitContext) -> Result<(), UnitError> {
        Ok(())
    }

    fn execute(&self, ctx: &UnitContext) -> Result<UnitOutput, UnitError>;

    /// Release resources. Runs after every attempt, whatever the outcome.
    fn cleanup(&self) -> Result<(), UnitError> {
        Ok(())
    }
}

// ── Lifecycle ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Created,
    Validating,
    Executing,
    Failed,
    Completed,
    Errored,
    CleanedUp,
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UnitState::Created => "created",
            UnitState::Validating => "validating",
            UnitState::Executing => "executing",
            UnitState::Failed => "failed",
            UnitState::Completed => "completed",
            UnitState::Errored => "errored",
            UnitState::CleanedUp => "cleaned_up",
        };
        f.write_str(s)
    }
}

/// Record of one pass through the lifecycle.
#[derive(Debug)]
pub struct UnitRun {
    pub unit: String,
    pub status: UnitStatus,
    pub output: UnitOutput,
    pub error: Option<UnitError>,
    pub cleanup_error: Option<UnitError>,
    /// Lifecycle states visited, in order.
    pub states: Vec<UnitState>,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
}

impl UnitRun {
    pub fn is_success(&self) -> bool {
        self.status == UnitStatus::Success
    }

    /// Last state before cleanup.
    pub fn final_state(&self) -> UnitState {
        self.states
            .iter()
            .rev()
            .find(|s| **s != UnitState::CleanedUp)
            .copied()
            .unwrap_or(UnitState::Created)
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration.as_millis() as u64
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn guarded<T>(f: impl FnOnce() -> Result<T, UnitError>) -> Result<T, UnitError> {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|p| Err(UnitError::Panicked(panic_message(p))))
}

/// Drive `unit` through validate, execute and cleanup, publishing
/// `UnitStarted` and `UnitCompleted` on `bus`.
///
/// A panic inside the unit is contained and reported as an execution error.
pub fn run_unit(unit: &dyn PipelineUnit, ctx: &UnitContext, bus: &TelemetryBus) -> UnitRun {
    let name = unit.name().to_string();
    let started_at = Utc::now();
    let start = Instant::now();
    let mut states = vec![UnitState::Created];

    bus.publish(TelemetryEvent::UnitStarted { unit: name.clone() });

    states.push(UnitState::Validating);
    let (status, output, error) = match guarded(|| unit.validate(ctx)) {
        Err(e) => {
            states.push(UnitState::Failed);
            debug!(unit = %name, error = %e, "validation rejected input");
            (UnitStatus::ValidationFailed, UnitOutput::default(), Some(e))
        }
        Ok(()) => {
            states.push(UnitState::Executing);
            match guarded(|| unit.execute(ctx)) {
                Ok(output) => {
                    states.push(UnitState::Completed);
                    (UnitStatus::Success, output, None)
                }
                Err(e) => {
                    states.push(UnitState::Errored);
                    warn!(unit = %name, kind = %e.kind(), error = %e, "unit execution failed");
                    (UnitStatus::ExecutionError, UnitOutput::default(), Some(e))
                }
            }
        }
    };

    let cleanup_error = match guarded(|| unit.cleanup()) {
        Ok(()) => None,
        Err(e) => {
            warn!(unit = %name, error = %e, "cleanup failed");
            Some(e)
        }
    };
    states.push(UnitState::CleanedUp);

    let duration = start.elapsed();
    bus.publish(TelemetryEvent::UnitCompleted {
        unit: name.clone(),
        status,
        duration_ms: duration.as_millis() as u64,
    });

    UnitRun {
        unit: name,
        status,
        output,
        error,
        cleanup_error,
        states,
        started_at,
        duration,
    }
}

/// A unit built from closures, handy for ad-hoc steps and tests.
pub struct FnUnit<V, E>
where
    V: Fn(&UnitContext) -> Result<(), UnitError> + Send + Sync,
    E: Fn(&UnitContext) -> Result<UnitOutput, UnitError> + Send + Sync,
{
    name: String,
    validate: V,
    execute: E,
}

impl<E> FnUnit<fn(&UnitContext) -> Result<(), UnitError>, E>
where
    E: Fn(&UnitContext) -> Result<UnitOutput, UnitError> + Send + Sync,
{
    pub fn new(name: impl Into<String>, execute: E) -> Self {
        fn accept(_: &UnitContext) -> Result<(), UnitError> {
            Ok(())
        }
        Self {
            name: name.into(),
            validate: accept,
            execute,
        }
    }
}

impl<V, E> FnUnit<V, E>
where
    V: Fn(&UnitContext) -> Result<(), UnitError> + Send + Sync,
    E: Fn(&UnitContext) -> Result<UnitOutput, UnitError> + Send + Sync,
{
    pub fn with_validation<V2>(self, validate: V2) -> FnUnit<V2, E>
    where
        V2: Fn(&UnitContext) -> Result<(), UnitError> + Send + Sync,
    {
        FnUnit {
            name: self.name,
            validate,
            execute: self.execute,
        }
    }
}

impl<V, E> PipelineUnit for FnUnit<V, E>
where
    V: Fn(&UnitContext) -> Result<(), UnitError> + Send + Sync,
    E: Fn(&UnitContext) -> Result<UnitOutput, UnitError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self, ctx: &UnitContext) -> Result<(), UnitError> {
        (self.validate)(ctx)
    }

    fn execute(&self, ctx: &UnitContext) -> Result<UnitOutput, UnitError> {
        (self.execute)(ctx)
    }
}
