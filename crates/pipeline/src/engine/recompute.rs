use std::collections::HashMap;

use chrono::Utc;
use tracing::{debug, info, warn};

use tipoff_core::{ChangeRecord, JobRecord, JobStatus, JobType, SourceId, TelemetryEvent};

use super::{worst, Engine, IngestOptions};
use crate::compose::{GraphComposition, GraphReport};
use crate::error::EngineError;
use crate::unit::UnitContext;
use crate::units::PARAM_JOB_ID;

/// Fingerprints of a dirty source captured before the run.
struct DirtySource {
    content_hash: String,
    last_processed_hash: Option<String>,
}

impl Engine {
    /// Recompute everything downstream of `ids`.
    ///
    /// Source IDs are kept only while dirty; node IDs are recomputed
    /// unconditionally together with their downstream closure. A source is
    /// committed as processed only when every node depending on it completed.
    pub fn run_recompute<S: AsRef<str>>(&self, ids: &[S]) -> JobRecord {
        let ids: Vec<String> = ids.iter().map(|s| s.as_ref().to_string()).collect();
        let mut job = JobRecord::start(JobType::Recompute, ids.clone());
        self.start_job(&job);
        let status = self.recompute_or_fail(&mut job, &ids);
        self.finish_job(&mut job, status);
        job
    }

    /// Ingest every configured source, then recompute whatever is dirty or
    /// stale.
    pub async fn run_full(&self) -> JobRecord {
        let sources = self.config.sources.clone();
        let mut job = JobRecord::start(JobType::Full, sources.iter().map(|s| s.id.clone()).collect());
        self.start_job(&job);

        let ingested = self.ingest_into(&mut job, &sources, IngestOptions::default()).await;
        if ingested == JobStatus::Failed {
            warn!(job_id = %job.job_id, "ingest failed fatally, skipping recompute");
            self.finish_job(&mut job, ingested);
            return job;
        }

        let roots = match self.full_roots() {
            Ok(roots) => roots,
            Err(e) => {
                job.record_failure("lineage", &e.kind().to_string(), &e.to_string());
                self.finish_job(&mut job, JobStatus::Failed);
                return job;
            }
        };
        let recomputed = self.recompute_or_fail(&mut job, &roots);
        self.finish_job(&mut job, worst(ingested, recomputed));
        job
    }

    /// Dirty sources plus stale nodes.
    fn full_roots(&self) -> Result<Vec<String>, EngineError> {
        let mut roots = self.registry.list_dirty(None)?;
        roots.extend(self.graph.stale_nodes(&self.registry)?);
        Ok(roots)
    }

    fn recompute_or_fail(&self, job: &mut JobRecord, ids: &[String]) -> JobStatus {
        match self.recompute_into(job, ids) {
            Ok(status) => status,
            Err(e) => {
                warn!(job_id = %job.job_id, kind = %e.kind(), error = %e, "recompute aborted");
                let id = match &e {
                    EngineError::UnboundNode(node) => node.clone(),
                    _ => "recompute".to_string(),
                };
                job.record_failure(&id, &e.kind().to_string(), &e.to_string());
                JobStatus::Failed
            }
        }
    }

    fn recompute_into(&self, job: &mut JobRecord, ids: &[String]) -> Result<JobStatus, EngineError> {
        let mut dirty: Vec<(SourceId, DirtySource)> = Vec::new();
        let mut roots: Vec<String> = Vec::new();
        for id in ids {
            if roots.contains(id) {
                continue;
            }
            if self.graph.contains(id) {
                roots.push(id.clone());
                continue;
            }
            match self.registry.get(id)? {
                Some(record) if record.is_dirty() => {
                    roots.push(id.clone());
                    dirty.push((
                        id.clone(),
                        DirtySource {
                            content_hash: record.content_hash,
                            last_processed_hash: record.last_processed_hash,
                        },
                    ));
                }
                Some(_) => debug!(source_id = %id, "source is clean, skipping"),
                None => warn!(id = %id, "unknown source or node, ignoring"),
            }
        }

        if roots.is_empty() {
            self.bus.publish(TelemetryEvent::GraphDirtySetComputed { size: 0 });
            info!(job_id = %job.job_id, "nothing dirty, nothing to recompute");
            return Ok(JobStatus::Success);
        }

        let order = self.graph.topological_order(&roots)?;
        self.bus
            .publish(TelemetryEvent::GraphDirtySetComputed { size: order.len() });
        info!(
            job_id = %job.job_id,
            roots = roots.len(),
            affected = order.len(),
            "dirty set computed"
        );

        let report = self.run_nodes(job, &order)?;
        let status = report.as_ref().map_or(JobStatus::Success, |r| r.status);

        for (source_id, before) in dirty {
            let closure = self.graph.downstream_closure(&[source_id.as_str()])?;
            let complete = closure.iter().all(|node| {
                report
                    .as_ref()
                    .and_then(|r| r.outcome(node))
                    .is_some_and(|o| o.is_completed())
            });
            if complete {
                if !self.registry.commit_processed(&source_id, &before.content_hash)? {
                    debug!(source_id = %source_id, "newer content arrived during the run, source stays dirty");
                }
            } else {
                self.registry.mark_failed(&source_id)?;
            }
            if !job.changes.iter().any(|c| c.source_id == source_id) {
                job.changes.push(ChangeRecord {
                    source_id,
                    old_hash: before.last_processed_hash,
                    new_hash: before.content_hash,
                    affected_node_ids: closure,
                });
            }
        }

        Ok(status)
    }

    /// Run `order` as one graph composition and record per-node results.
    /// Returns `None` when there was nothing to run.
    fn run_nodes(&self, job: &mut JobRecord, order: &[String]) -> Result<Option<GraphReport>, EngineError> {
        if order.is_empty() {
            return Ok(None);
        }

        let mut composition = GraphComposition::new(
            format!("recompute-{}", job.job_id),
            self.config.composition.resolved_worker_limit(),
            std::sync::Arc::clone(&self.bus),
        )
        .with_cancel(self.cancel.clone());

        let mut deps: HashMap<&str, Vec<String>> = HashMap::new();
        for id in order {
            let node = self
                .graph
                .node(id)?
                .ok_or_else(|| tipoff_lineage::LineageError::UnknownNode(id.clone()))?;
            deps.insert(id.as_str(), node.depends_on);
        }
        for id in order {
            let unit = self
                .unit_for(id)
                .ok_or_else(|| EngineError::UnboundNode(id.clone()))?;
            let node_deps = deps.get(id.as_str()).map(Vec::as_slice).unwrap_or_default();
            composition.add(id.as_str(), unit, node_deps);
        }

        let ctx = UnitContext::new().with_param(PARAM_JOB_ID, job.job_id.to_string());
        let report = composition.run(&ctx)?;

        let computed_at = Utc::now();
        for (id, outcome) in &report.outcomes {
            if outcome.run().is_some() {
                job.executed_nodes.push(id.clone());
            }
            if outcome.is_completed() {
                self.graph.mark_computed(id, computed_at)?;
            } else if let Some(kind) = outcome.error_kind() {
                job.record_failure(id, &kind.to_string(), &outcome.message());
            }
        }
        if report.cancelled {
            warn!(job_id = %job.job_id, "recompute cancelled, unstarted nodes left dirty");
        }
        Ok(Some(report))
    }
}
