use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde_json::json;

use tipoff_core::{ErrorKind, JobStatus, RecordingObserver, TelemetryBus, UnitStatus};
use tipoff_lineage::StorageError;

use super::*;
use crate::error::UnitError;
use crate::unit::{Artifact, FnUnit, PipelineUnit, UnitContext, UnitOutput, UnitState};

fn bus() -> Arc<TelemetryBus> {
    Arc::new(TelemetryBus::new())
}

fn ids(v: &[&str]) -> Vec<String> {
    v.iter().map(|s| s.to_string()).collect()
}

/// Emits `{name: <sum of numeric inputs + 1>}`.
fn adder(name: &'static str) -> Arc<dyn PipelineUnit> {
    Arc::new(FnUnit::new(name, move |ctx: &UnitContext| {
        let sum: i64 = ctx
            .inputs()
            .values()
            .filter_map(|a| a.as_json().and_then(|v| v.as_i64()))
            .sum();
        Ok(UnitOutput::new().with_artifact(name, Artifact::Json(json!(sum + 1))))
    }))
}

fn rejecting(name: &'static str) -> Arc<dyn PipelineUnit> {
    Arc::new(
        FnUnit::new(name, |_ctx: &UnitContext| Ok(UnitOutput::new()))
            .with_validation(|_ctx: &UnitContext| Err(UnitError::Validation("schema mismatch".into()))),
    )
}

fn failing(name: &'static str) -> Arc<dyn PipelineUnit> {
    Arc::new(FnUnit::new(name, |_ctx: &UnitContext| {
        Err(UnitError::Execution("division by zero".into()))
    }))
}

/// Tracks how many instances run at once.
struct Gauge {
    name: String,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    started: Arc<Mutex<Vec<String>>>,
}

impl PipelineUnit for Gauge {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, _ctx: &UnitContext) -> Result<UnitOutput, UnitError> {
        self.started.lock().unwrap().push(self.name.clone());
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(20));
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(UnitOutput::new())
    }
}

// ── Sequence ────────────────────────────────────────────────────

#[test]
fn sequence_threads_outputs_forward() {
    let seq = Sequence::new("chain", bus())
        .then(adder("a"))
        .then(adder("b"))
        .then(adder("c"));

    let report = seq.run(&UnitContext::new());
    assert!(report.is_success());
    assert_eq!(report.runs.len(), 3);
    // a = 1, b = a + 1 = 2, c = a + b + 1 = 4
    assert_eq!(report.output.artifacts["c"], Artifact::Json(json!(4)));
}

#[test]
fn sequence_halts_on_first_failure_with_partial_results() {
    let seq = Sequence::new("chain", bus())
        .then(adder("a"))
        .then(rejecting("b"))
        .then(adder("c"));

    let report = seq.run(&UnitContext::new());
    assert_eq!(report.failed_unit.as_deref(), Some("b"));
    assert_eq!(report.runs.len(), 2);
    assert_eq!(report.runs[1].status, UnitStatus::ValidationFailed);
    assert!(report.output.artifacts.contains_key("a"));
    assert!(!report.output.artifacts.contains_key("c"));
}

#[test]
fn sequence_validates_only_first_unit_up_front() {
    let needs_input = Arc::new(
        FnUnit::new("needs_a", |_ctx: &UnitContext| Ok(UnitOutput::new())).with_validation(
            |ctx: &UnitContext| {
                ctx.input("a")
                    .map(|_| ())
                    .ok_or_else(|| UnitError::Validation("missing a".into()))
            },
        ),
    );
    let seq = Sequence::new("chain", bus()).then(adder("a")).then(needs_input);

    // Up front, only `a` is checked, so the composite accepts an empty context.
    assert!(seq.validate(&UnitContext::new()).is_ok());
    // At run time `needs_a` sees a's real output.
    assert!(seq.run(&UnitContext::new()).is_success());
}

#[test]
fn sequence_as_unit_reports_failing_component() {
    let seq = Sequence::new("chain", bus()).then(adder("a")).then(failing("b"));
    let err = seq.execute(&UnitContext::new()).unwrap_err();
    match err {
        UnitError::ComponentFailed { unit, kind, .. } => {
            assert_eq!(unit, "b");
            assert_eq!(kind, ErrorKind::Terminal);
        }
        other => panic!("unexpected error {other:?}"),
    }
}

// ── Graph ───────────────────────────────────────────────────────

#[test]
fn validation_failure_skips_downstream() {
    // s1, s2 -> e1 -> f1 with e1 rejecting its input.
    let mut graph = GraphComposition::new("recompute", 2, bus());
    graph.add("e1", rejecting("e1"), &ids(&["s1", "s2"]));
    graph.add("f1", adder("f1"), &ids(&["e1"]));

    let report = graph.run(&UnitContext::new()).unwrap();

    assert_eq!(report.status, JobStatus::PartialFailure);
    let e1 = report.outcome("e1").unwrap();
    assert_eq!(e1.label(), "validation_failed");
    assert_eq!(e1.run().unwrap().status, UnitStatus::ValidationFailed);
    assert!(matches!(
        report.outcome("f1"),
        Some(NodeOutcome::Skipped { cause }) if cause == "e1"
    ));
}

#[test]
fn failure_only_skips_its_own_closure() {
    let mut graph = GraphComposition::new("g", 4, bus());
    graph.add("a", failing("a"), &[]);
    graph.add("b", adder("b"), &ids(&["a"]));
    graph.add("c", adder("c"), &ids(&["b"]));
    graph.add("x", adder("x"), &[]);
    graph.add("y", adder("y"), &ids(&["x"]));

    let report = graph.run(&UnitContext::new()).unwrap();

    assert_eq!(report.status, JobStatus::PartialFailure);
    assert_eq!(report.outcome("b").unwrap().label(), "skipped");
    assert_eq!(report.outcome("c").unwrap().label(), "skipped");
    assert_eq!(report.completed(), vec!["x", "y"]);
    assert_eq!(report.failures().len(), 3);
}

#[test]
fn dependents_receive_upstream_artifacts() {
    let mut graph = GraphComposition::new("g", 2, bus());
    graph.add("a", adder("a"), &[]);
    graph.add("b", adder("b"), &[]);
    graph.add("c", adder("c"), &ids(&["a", "b"]));

    let report = graph.run(&UnitContext::new()).unwrap();
    assert_eq!(report.status, JobStatus::Success);
    assert_eq!(report.merged_output().artifacts["c"], Artifact::Json(json!(3)));
}

#[test]
fn worker_limit_bounds_parallelism() {
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let started = Arc::new(Mutex::new(Vec::new()));
    let mut graph = GraphComposition::new("wide", 3, bus());
    for i in 0..10 {
        let name = format!("n{i}");
        graph.add(
            name.clone(),
            Arc::new(Gauge {
                name,
                active: Arc::clone(&active),
                peak: Arc::clone(&peak),
                started: Arc::clone(&started),
            }),
            &[],
        );
    }

    let report = graph.run(&UnitContext::new()).unwrap();
    assert_eq!(report.status, JobStatus::Success);
    assert!(peak.load(Ordering::SeqCst) <= 3);
    assert_eq!(started.lock().unwrap().len(), 10);
}

#[test]
fn node_never_starts_before_its_dependencies_finish() {
    let order = Arc::new(Mutex::new(Vec::<String>::new()));
    let mut graph = GraphComposition::new("g", 4, bus());
    for (id, deps) in [("a", vec![]), ("b", vec!["a"]), ("c", vec!["a"]), ("d", vec!["b", "c"])] {
        let log = Arc::clone(&order);
        let unit = Arc::new(FnUnit::new(id, move |_ctx: &UnitContext| {
            thread::sleep(Duration::from_millis(5));
            log.lock().unwrap().push(id.to_string());
            Ok(UnitOutput::new())
        }));
        graph.add(id, unit, &ids(&deps));
    }

    graph.run(&UnitContext::new()).unwrap();
    let order = order.lock().unwrap().clone();
    let pos = |x: &str| order.iter().position(|o| o == x).unwrap();
    assert_eq!(pos("a"), 0);
    assert_eq!(pos("d"), 3);
}

#[test]
fn cancellation_lets_in_flight_finish_and_starts_nothing_new() {
    let cancel = CancelFlag::new();
    let trigger = cancel.clone();
    let mut graph = GraphComposition::new("g", 1, bus()).with_cancel(cancel);
    graph.add(
        "first",
        Arc::new(FnUnit::new("first", move |_ctx: &UnitContext| {
            trigger.cancel();
            Ok(UnitOutput::new())
        })),
        &[],
    );
    graph.add("second", adder("second"), &[]);
    graph.add("third", adder("third"), &ids(&["first"]));

    let report = graph.run(&UnitContext::new()).unwrap();

    assert!(report.cancelled);
    assert!(report.outcome("first").unwrap().is_completed());
    assert!(matches!(report.outcome("second"), Some(NodeOutcome::Cancelled)));
    assert!(matches!(report.outcome("third"), Some(NodeOutcome::Cancelled)));
    assert_eq!(report.status, JobStatus::PartialFailure);
}

#[test]
fn cancelled_sequence_finishes_current_unit_and_runs_no_more() {
    let cancel = CancelFlag::new();
    let trigger = cancel.clone();
    let seq = Sequence::new("chain", bus())
        .with_cancel(cancel)
        .then(adder("a"))
        .then(Arc::new(FnUnit::new("b", move |_ctx: &UnitContext| {
            trigger.cancel();
            Ok(UnitOutput::new().with_artifact("b", Artifact::Json(json!(2))))
        })))
        .then(adder("c"));

    let report = seq.run(&UnitContext::new());

    assert!(report.cancelled);
    assert!(!report.is_success());
    assert_eq!(report.failed_unit, None);
    assert_eq!(report.runs.len(), 2);
    assert!(report.output.artifacts.contains_key("b"));
    assert!(!report.output.artifacts.contains_key("c"));
    assert!(matches!(seq.execute(&UnitContext::new()), Err(UnitError::Cancelled)));
}

#[test]
fn dependencies_may_be_added_after_their_dependents() {
    let order = Arc::new(Mutex::new(Vec::<String>::new()));
    let mut graph = GraphComposition::new("g", 1, bus());
    for (id, deps) in [("report", vec!["totals"]), ("totals", vec!["raw"]), ("raw", vec![])] {
        let log = Arc::clone(&order);
        let inner = adder(id);
        let unit = Arc::new(FnUnit::new(id, move |ctx: &UnitContext| {
            log.lock().unwrap().push(id.to_string());
            inner.execute(ctx)
        }));
        graph.add(id, unit, &ids(&deps));
    }

    let report = graph.run(&UnitContext::new()).unwrap();

    assert_eq!(report.status, JobStatus::Success);
    assert_eq!(*order.lock().unwrap(), ids(&["raw", "totals", "report"]));
    let output = report.merged_output();
    assert_eq!(output.artifacts["totals"], Artifact::Json(json!(2)));
    assert_eq!(output.artifacts["report"], Artifact::Json(json!(3)));
}

#[test]
fn dependency_cycle_is_rejected() {
    let mut graph = GraphComposition::new("g", 2, bus());
    graph.add("a", adder("a"), &ids(&["b"]));
    graph.add("b", adder("b"), &ids(&["a"]));
    graph.add("free", adder("free"), &ids(&["external"]));

    let err = graph.run(&UnitContext::new()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(err.to_string().contains("a, b"));
}

#[test]
fn fatal_error_aborts_the_run() {
    let mut graph = GraphComposition::new("g", 1, bus());
    graph.add(
        "store",
        Arc::new(FnUnit::new("store", |_ctx: &UnitContext| {
            Err(UnitError::Storage(StorageError::Unavailable("disk full".into())))
        })),
        &[],
    );
    graph.add("other", adder("other"), &[]);

    let report = graph.run(&UnitContext::new()).unwrap();
    assert_eq!(report.status, JobStatus::Failed);
    assert_eq!(report.fatal.as_deref(), Some("store"));
    assert!(matches!(report.outcome("other"), Some(NodeOutcome::Cancelled)));
}

#[test]
fn compositions_nest() {
    let bus = bus();
    let inner = Arc::new(Sequence::new("inner", Arc::clone(&bus)).then(adder("p")).then(adder("q")));
    let mut graph = GraphComposition::new("outer", 2, Arc::clone(&bus));
    graph.add("seq", inner, &[]);
    graph.add("r", adder("r"), &ids(&["seq"]));

    let outer = Sequence::new("top", Arc::clone(&bus)).then(Arc::new(graph));
    let report = outer.run(&UnitContext::new());

    assert!(report.is_success());
    // p = 1, q = 2, r = p + q + 1 = 4
    assert_eq!(report.output.artifacts["r"], Artifact::Json(json!(4)));
}

#[test]
fn every_node_emits_lifecycle_events() {
    let bus = bus();
    let rec = Arc::new(RecordingObserver::new());
    bus.subscribe(rec.clone());

    let mut graph = GraphComposition::new("g", 2, Arc::clone(&bus));
    graph.add("a", adder("a"), &[]);
    graph.add("b", failing("b"), &ids(&["a"]));
    graph.add("c", adder("c"), &ids(&["b"]));
    graph.run(&UnitContext::new()).unwrap();

    assert_eq!(rec.count("unit_started"), 2);
    assert_eq!(rec.count("unit_completed"), 2);
}

#[test]
fn failed_run_records_lifecycle() {
    let mut graph = GraphComposition::new("g", 1, bus());
    graph.add("a", failing("a"), &[]);
    let report = graph.run(&UnitContext::new()).unwrap();
    let run = report.outcome("a").unwrap().run().unwrap();
    assert_eq!(run.final_state(), UnitState::Errored);
    assert_eq!(run.states.last(), Some(&UnitState::CleanedUp));
}
