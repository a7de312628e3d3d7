//! Sequential composition: units run in declared order on the calling thread.

use std::sync::Arc;

use tracing::{debug, info};

use tipoff_core::{ErrorKind, TelemetryBus};

use crate::compose::CancelFlag;
use crate::error::UnitError;
use crate::unit::{run_unit, PipelineUnit, UnitContext, UnitOutput, UnitRun};

/// Outcome of a sequential run.
#[derive(Debug)]
pub struct SequenceReport {
    /// One entry per unit that ran, in order. Units after a failure are absent.
    pub runs: Vec<UnitRun>,
    /// Artifacts of every completed unit, merged in order.
    pub output: UnitOutput,
    /// Name of the unit that halted the chain.
    pub failed_unit: Option<String>,
    /// Cancelled before every unit got to run.
    pub cancelled: bool,
}

impl SequenceReport {
    pub fn is_success(&self) -> bool {
        self.failed_unit.is_none() && !self.cancelled
    }

    pub fn failure(&self) -> Option<&UnitRun> {
        self.runs.iter().find(|r| !r.is_success())
    }
}

pub struct Sequence {
    name: String,
    units: Vec<Arc<dyn PipelineUnit>>,
    bus: Arc<TelemetryBus>,
    cancel: CancelFlag,
}

impl Sequence {
    pub fn new(name: impl Into<String>, bus: Arc<TelemetryBus>) -> Self {
        Self {
            name: name.into(),
            units: Vec::new(),
            bus,
            cancel: CancelFlag::new(),
        }
    }

    /// Share a cancellation flag with the caller. It is checked before each
    /// unit; a unit already running always finishes.
    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn then(mut self, unit: Arc<dyn PipelineUnit>) -> Self {
        self.units.push(unit);
        self
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Run every unit in order. Each unit sees the initial context merged
    /// with the artifacts of all units before it. The first failure halts
    /// the chain.
    pub fn run(&self, ctx: &UnitContext) -> SequenceReport {
        let mut current = ctx.clone();
        let mut output = UnitOutput::default();
        let mut runs = Vec::with_capacity(self.units.len());

        for unit in &self.units {
            if self.cancel.is_cancelled() {
                info!(
                    sequence = %self.name,
                    completed = runs.len(),
                    remaining = self.units.len() - runs.len(),
                    "sequence cancelled"
                );
                return SequenceReport {
                    runs,
                    output,
                    failed_unit: None,
                    cancelled: true,
                };
            }
            let run = run_unit(unit.as_ref(), &current, &self.bus);
            if !run.is_success() {
                info!(
                    sequence = %self.name,
                    unit = %run.unit,
                    status = %run.status,
                    completed = runs.len(),
                    "sequence halted"
                );
                let failed = run.unit.clone();
                runs.push(run);
                return SequenceReport {
                    runs,
                    output,
                    failed_unit: Some(failed),
                    cancelled: false,
                };
            }
            current.merge(&run.output);
            output.absorb(run.output.clone());
            runs.push(run);
        }

        debug!(sequence = %self.name, units = runs.len(), "sequence completed");
        SequenceReport {
            runs,
            output,
            failed_unit: None,
            cancelled: false,
        }
    }
}

impl PipelineUnit for Sequence {
    fn name(&self) -> &str {
        &self.name
    }

    /// Only the first unit can be checked up front; later units validate
    /// against the real output of their predecessors when they run.
    fn validate(&self, ctx: &UnitContext) -> Result<(), UnitError> {
        match self.units.first() {
            Some(first) => first.validate(ctx),
            None => Ok(()),
        }
    }

    fn execute(&self, ctx: &UnitContext) -> Result<UnitOutput, UnitError> {
        let mut report = self.run(ctx);
        if report.cancelled {
            return Err(UnitError::Cancelled);
        }
        match report.runs.pop() {
            Some(last) if !last.is_success() => {
                let (kind, message) = match &last.error {
                    Some(e) => (e.kind(), e.to_string()),
                    None => (ErrorKind::Terminal, last.status.to_string()),
                };
                Err(UnitError::ComponentFailed {
                    unit: last.unit,
                    kind,
                    message,
                })
            }
            _ => Ok(report.output),
        }
    }
}
