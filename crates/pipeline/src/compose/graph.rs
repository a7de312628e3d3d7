//! Graph composition: dependency-ordered execution on a fixed worker pool.
//!
//! Ready nodes (all dependencies completed) are dispatched to a rayon pool
//! of `worker_limit` threads. The calling thread owns all bookkeeping and
//! learns about finished nodes over a channel, so no scheduling state is
//! shared with the workers. A failed node marks its downstream closure
//! `Skipped`; independent branches keep running.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::mpsc;
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::{debug, info, warn};

use tipoff_core::{ErrorKind, JobStatus, NodeId, TelemetryBus, UnitStatus};

use crate::compose::CancelFlag;
use crate::error::UnitError;
use crate::unit::{run_unit, PipelineUnit, UnitContext, UnitOutput, UnitRun};

/// Terminal state of one node in a graph run.
#[derive(Debug)]
pub enum NodeOutcome {
    Completed(UnitRun),
    /// Validation failure or execution error.
    Failed(UnitRun),
    /// An upstream node failed; this node never started.
    Skipped { cause: NodeId },
    /// The run was cancelled or aborted before this node started.
    Cancelled,
}

impl NodeOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            NodeOutcome::Completed(_) => "completed",
            NodeOutcome::Failed(run) => match run.status {
                UnitStatus::ValidationFailed => "validation_failed",
                _ => "execution_error",
            },
            NodeOutcome::Skipped { .. } => "skipped",
            NodeOutcome::Cancelled => "cancelled",
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, NodeOutcome::Completed(_))
    }

    pub fn run(&self) -> Option<&UnitRun> {
        match self {
            NodeOutcome::Completed(run) | NodeOutcome::Failed(run) => Some(run),
            _ => None,
        }
    }

    /// Error kind for anything that did not complete.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            NodeOutcome::Completed(_) => None,
            NodeOutcome::Failed(run) => Some(
                run.error
                    .as_ref()
                    .map(UnitError::kind)
                    .unwrap_or(ErrorKind::Terminal),
            ),
            NodeOutcome::Skipped { .. } => Some(ErrorKind::Terminal),
            NodeOutcome::Cancelled => Some(ErrorKind::Cancelled),
        }
    }

    pub fn message(&self) -> String {
        match self {
            NodeOutcome::Completed(_) => String::new(),
            NodeOutcome::Failed(run) => run
                .error
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| run.status.to_string()),
            NodeOutcome::Skipped { cause } => format!("skipped: upstream {cause} failed"),
            NodeOutcome::Cancelled => "cancelled before start".to_string(),
        }
    }
}

/// Outcome of a graph run, in node insertion order.
#[derive(Debug)]
pub struct GraphReport {
    pub outcomes: IndexMap<NodeId, NodeOutcome>,
    pub status: JobStatus,
    /// First node whose error aborted the run.
    pub fatal: Option<NodeId>,
    pub cancelled: bool,
}

impl GraphReport {
    pub fn outcome(&self, id: &str) -> Option<&NodeOutcome> {
        self.outcomes.get(id)
    }

    pub fn completed(&self) -> Vec<&NodeId> {
        self.outcomes
            .iter()
            .filter(|(_, o)| o.is_completed())
            .map(|(id, _)| id)
            .collect()
    }

    /// Nodes that did not complete, with their outcome.
    pub fn failures(&self) -> Vec<(&NodeId, &NodeOutcome)> {
        self.outcomes.iter().filter(|(_, o)| !o.is_completed()).collect()
    }

    /// Artifacts of every completed node, in insertion order.
    pub fn merged_output(&self) -> UnitOutput {
        let mut out = UnitOutput::default();
        for outcome in self.outcomes.values() {
            if let NodeOutcome::Completed(run) = outcome {
                out.absorb(run.output.clone());
            }
        }
        out
    }
}

struct GraphNode {
    unit: Arc<dyn PipelineUnit>,
    /// Declared dependencies, resolved against the node set when the graph runs.
    depends_on: Vec<NodeId>,
}

pub struct GraphComposition {
    name: String,
    nodes: IndexMap<NodeId, GraphNode>,
    worker_limit: usize,
    bus: Arc<TelemetryBus>,
    cancel: CancelFlag,
}

impl GraphComposition {
    pub fn new(name: impl Into<String>, worker_limit: usize, bus: Arc<TelemetryBus>) -> Self {
        Self {
            name: name.into(),
            nodes: IndexMap::new(),
            worker_limit: worker_limit.max(1),
            bus,
            cancel: CancelFlag::new(),
        }
    }

    /// Share a cancellation flag with the caller.
    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Add a node. Nodes may be added in any order; dependency IDs that are
    /// still not nodes of this composition when it runs are external inputs
    /// and count as already satisfied.
    pub fn add(
        &mut self,
        id: impl Into<NodeId>,
        unit: Arc<dyn PipelineUnit>,
        depends_on: &[NodeId],
    ) -> &mut Self {
        self.nodes.insert(
            id.into(),
            GraphNode {
                unit,
                depends_on: depends_on.to_vec(),
            },
        );
        self
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn worker_limit(&self) -> usize {
        self.worker_limit
    }

    /// Dependencies of every node restricted to nodes of this composition.
    /// Fails when those edges form a cycle, since no node on it could start.
    fn internal_deps(&self) -> Result<IndexMap<&str, Vec<&str>>, UnitError> {
        let deps: IndexMap<&str, Vec<&str>> = self
            .nodes
            .iter()
            .map(|(id, node)| {
                let internal = node
                    .depends_on
                    .iter()
                    .filter_map(|d| self.nodes.get_key_value(d.as_str()))
                    .map(|(key, _)| key.as_str())
                    .collect();
                (id.as_str(), internal)
            })
            .collect();

        let dependents = dependents(&deps);
        let mut pending: HashMap<&str, usize> = deps.iter().map(|(id, d)| (*id, d.len())).collect();
        let mut queue: VecDeque<&str> = pending
            .iter()
            .filter(|(_, n)| **n == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut ordered = 0usize;
        while let Some(id) = queue.pop_front() {
            ordered += 1;
            for &child in dependents.get(id).into_iter().flatten() {
                if let Some(count) = pending.get_mut(child) {
                    *count -= 1;
                    if *count == 0 {
                        queue.push_back(child);
                    }
                }
            }
        }
        if ordered < deps.len() {
            let stuck: Vec<&str> = self
                .nodes
                .keys()
                .map(String::as_str)
                .filter(|id| pending.get(id).is_some_and(|n| *n > 0))
                .collect();
            return Err(UnitError::Validation(format!(
                "graph {} has a dependency cycle through {}",
                self.name,
                stuck.join(", ")
            )));
        }
        Ok(deps)
    }

    /// Execute the graph. Every node gets the run context merged with the
    /// artifacts of its dependencies.
    pub fn run(&self, ctx: &UnitContext) -> Result<GraphReport, UnitError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.worker_limit)
            .thread_name(|i| format!("tipoff-graph-{i}"))
            .build()
            .map_err(|e| UnitError::Execution(format!("failed to build worker pool: {e}")))?;

        info!(
            graph = %self.name,
            nodes = self.nodes.len(),
            workers = self.worker_limit,
            "graph run starting"
        );

        let deps = self.internal_deps()?;
        let dependents = dependents(&deps);
        let mut pending: HashMap<&str, usize> = deps.iter().map(|(id, d)| (*id, d.len())).collect();
        let mut ready: VecDeque<&str> = self
            .nodes
            .keys()
            .map(String::as_str)
            .filter(|id| pending.get(id).is_some_and(|n| *n == 0))
            .collect();

        let mut outcomes: HashMap<NodeId, NodeOutcome> = HashMap::new();
        let mut outputs: HashMap<&str, UnitOutput> = HashMap::new();
        let mut fatal: Option<NodeId> = None;
        let mut running = 0usize;
        let (tx, rx) = mpsc::channel::<(NodeId, UnitRun)>();

        loop {
            while running < self.worker_limit && fatal.is_none() && !self.cancel.is_cancelled() {
                let Some(id) = ready.pop_front() else { break };
                let Some(node) = self.nodes.get(id) else { continue };

                let mut node_ctx = ctx.clone();
                for dep in deps.get(id).into_iter().flatten() {
                    if let Some(out) = outputs.get(dep) {
                        node_ctx.merge(out);
                    }
                }

                let unit = Arc::clone(&node.unit);
                let bus = Arc::clone(&self.bus);
                let tx = tx.clone();
                let node_id = id.to_string();
                debug!(graph = %self.name, node = %node_id, "dispatching node");
                pool.spawn(move || {
                    let run = run_unit(unit.as_ref(), &node_ctx, &bus);
                    let _ = tx.send((node_id, run));
                });
                running += 1;
            }

            if running == 0 {
                break;
            }
            let Ok((id, run)) = rx.recv() else { break };
            running -= 1;

            let Some((key, _)) = self.nodes.get_key_value(id.as_str()) else {
                continue;
            };
            let key = key.as_str();

            if run.is_success() {
                outputs.insert(key, run.output.clone());
                outcomes.insert(id, NodeOutcome::Completed(run));
                for &child in dependents.get(key).into_iter().flatten() {
                    if let Some(count) = pending.get_mut(child) {
                        *count = count.saturating_sub(1);
                        if *count == 0 && !outcomes.contains_key(child) {
                            ready.push_back(child);
                        }
                    }
                }
                continue;
            }

            let kind = run.error.as_ref().map(UnitError::kind);
            warn!(
                graph = %self.name,
                node = %id,
                status = %run.status,
                kind = ?kind,
                "node failed, skipping downstream"
            );
            if kind.is_some_and(|k| k.is_fatal()) && fatal.is_none() {
                fatal = Some(id.clone());
            }
            outcomes.insert(id, NodeOutcome::Failed(run));
            skip_downstream(key, &dependents, &mut outcomes);
        }

        let cancelled = self.cancel.is_cancelled();
        let mut ordered = IndexMap::with_capacity(self.nodes.len());
        for id in self.nodes.keys() {
            let outcome = outcomes.remove(id).unwrap_or(NodeOutcome::Cancelled);
            ordered.insert(id.clone(), outcome);
        }

        let status = if fatal.is_some() {
            JobStatus::Failed
        } else if ordered.values().all(NodeOutcome::is_completed) {
            JobStatus::Success
        } else {
            JobStatus::PartialFailure
        };

        info!(
            graph = %self.name,
            status = ?status,
            completed = ordered.values().filter(|o| o.is_completed()).count(),
            total = ordered.len(),
            cancelled,
            "graph run finished"
        );

        Ok(GraphReport {
            outcomes: ordered,
            status,
            fatal,
            cancelled,
        })
    }
}

/// Invert a dependency map: node to the nodes that depend on it.
fn dependents<'a>(deps: &IndexMap<&'a str, Vec<&'a str>>) -> HashMap<&'a str, Vec<&'a str>> {
    let mut index: HashMap<&str, Vec<&str>> = HashMap::new();
    for (&id, node_deps) in deps {
        for &dep in node_deps {
            index.entry(dep).or_default().push(id);
        }
    }
    index
}

/// Mark every not-yet-terminal node downstream of `failed` as skipped.
fn skip_downstream(
    failed: &str,
    dependents: &HashMap<&str, Vec<&str>>,
    outcomes: &mut HashMap<NodeId, NodeOutcome>,
) {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<&str> = dependents.get(failed).cloned().unwrap_or_default().into();
    while let Some(id) = queue.pop_front() {
        if !seen.insert(id) {
            continue;
        }
        outcomes.entry(id.to_string()).or_insert_with(|| NodeOutcome::Skipped {
            cause: failed.to_string(),
        });
        if let Some(children) = dependents.get(id) {
            queue.extend(children.iter().copied());
        }
    }
}

impl PipelineUnit for GraphComposition {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, ctx: &UnitContext) -> Result<UnitOutput, UnitError> {
        let report = self.run(ctx)?;
        if report.status == JobStatus::Success {
            return Ok(report.merged_output());
        }
        match report
            .outcomes
            .iter()
            .find(|(_, o)| matches!(o, NodeOutcome::Failed(_)))
        {
            Some((id, outcome)) => Err(UnitError::ComponentFailed {
                unit: id.clone(),
                kind: outcome.error_kind().unwrap_or(ErrorKind::Terminal),
                message: outcome.message(),
            }),
            None => Err(UnitError::Cancelled),
        }
    }
}
