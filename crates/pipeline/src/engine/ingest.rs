use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use tipoff_core::{
    ChangeRecord, ErrorKind, JobRecord, JobStatus, JobType, SourceConfig, TelemetryEvent,
};
use tipoff_governor::{FetchRequest, GovernorError};

use super::Engine;
use crate::units::ingest::{META_CHANGED, META_HASH, META_PREVIOUS_HASH};
use crate::units::{IngestUnit, PARAM_JOB_ID};
use crate::unit::run_unit;

/// Which configured sources an ingest run covers. Empty criteria match all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceFilter {
    ids: Vec<String>,
    source_type: Option<String>,
}

impl SourceFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ids: ids.into_iter().map(Into::into).collect(),
            source_type: None,
        }
    }

    pub fn of_type(mut self, source_type: impl Into<String>) -> Self {
        self.source_type = Some(source_type.into());
        self
    }

    pub fn matches(&self, source: &SourceConfig) -> bool {
        (self.ids.is_empty() || self.ids.iter().any(|id| *id == source.id))
            && self
                .source_type
                .as_deref()
                .map_or(true, |t| t == source.source_type)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestOptions {
    /// Treat every fetched source as changed, even with an identical
    /// fingerprint.
    pub force: bool,
}

enum IngestOutcome {
    Fetched {
        source_id: String,
        changed: bool,
        previous_hash: Option<String>,
        new_hash: String,
    },
    Failed {
        source_id: String,
        kind: ErrorKind,
        message: String,
    },
}

impl Engine {
    /// Fetch the selected sources under the governor, persist their payloads
    /// and register fingerprints. Changed sources are reported as change
    /// records with their downstream closure.
    pub async fn run_ingest(&self, filter: &SourceFilter, options: IngestOptions) -> JobRecord {
        let sources: Vec<SourceConfig> = self
            .config
            .sources
            .iter()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect();
        for id in &filter.ids {
            if !self.config.sources.iter().any(|s| s.id == *id) {
                warn!(source_id = %id, "no configured source with this id");
            }
        }

        let mut job = JobRecord::start(JobType::Ingest, sources.iter().map(|s| s.id.clone()).collect());
        self.start_job(&job);
        let status = self.ingest_into(&mut job, &sources, options).await;
        self.finish_job(&mut job, status);
        job
    }

    pub(crate) async fn ingest_into(
        &self,
        job: &mut JobRecord,
        sources: &[SourceConfig],
        options: IngestOptions,
    ) -> JobStatus {
        if sources.is_empty() {
            info!(job_id = %job.job_id, "no sources selected, nothing to ingest");
            return JobStatus::Success;
        }

        let unit = IngestUnit::new(Arc::clone(&self.registry), Arc::clone(&self.sink))
            .with_force(options.force);
        let job_id = job.job_id.to_string();
        let width = self.governor.config().max_concurrency;

        info!(
            job_id = %job_id,
            sources = sources.len(),
            force = options.force,
            "ingest starting"
        );

        let outcomes: Vec<IngestOutcome> = stream::iter(sources)
            .map(|source| self.ingest_one(source, &unit, &job_id))
            .buffer_unordered(width)
            .collect()
            .await;

        let mut status = JobStatus::Success;
        for outcome in outcomes {
            match outcome {
                IngestOutcome::Fetched {
                    source_id,
                    changed,
                    previous_hash,
                    new_hash,
                } => {
                    if !(changed || options.force) {
                        continue;
                    }
                    let affected = match self.graph.downstream_closure(&[source_id.as_str()]) {
                        Ok(affected) => affected,
                        Err(e) => {
                            warn!(source_id = %source_id, error = %e, "could not compute downstream closure");
                            Vec::new()
                        }
                    };
                    job.changes.push(ChangeRecord {
                        source_id,
                        old_hash: previous_hash,
                        new_hash,
                        affected_node_ids: affected,
                    });
                }
                IngestOutcome::Failed {
                    source_id,
                    kind,
                    message,
                } => {
                    job.record_failure(&source_id, &kind.to_string(), &message);
                    status = if kind.is_fatal() {
                        JobStatus::Failed
                    } else {
                        super::worst(status, JobStatus::PartialFailure)
                    };
                }
            }
        }

        self.governor.log_summary();
        info!(
            job_id = %job_id,
            changed = job.changes.len(),
            failed = job.failures.len(),
            "ingest finished"
        );
        status
    }

    async fn ingest_one(&self, source: &SourceConfig, unit: &IngestUnit, job_id: &str) -> IngestOutcome {
        if self.cancel.is_cancelled() {
            return IngestOutcome::Failed {
                source_id: source.id.clone(),
                kind: ErrorKind::Cancelled,
                message: "cancelled before start".into(),
            };
        }

        let request = FetchRequest::from(source);
        let request = &request;
        let governor = self.governor.as_ref();
        let client = self.client.as_ref();
        let cancel = &self.cancel;
        let fetched = self
            .retry
            .run(&source.id, |_attempt| async move {
                if cancel.is_cancelled() {
                    return Err(GovernorError::Closed);
                }
                governor.fetch(client, request).await
            })
            .await;

        let payload = match fetched {
            Ok(payload) => payload,
            Err(e) => {
                warn!(source_id = %source.id, kind = %e.kind(), error = %e, "fetch failed");
                if let Err(mark) = self.registry.mark_failed(&source.id) {
                    warn!(source_id = %source.id, error = %mark, "could not mark source failed");
                }
                return IngestOutcome::Failed {
                    source_id: source.id.clone(),
                    kind: e.kind(),
                    message: e.to_string(),
                };
            }
        };

        let ctx = IngestUnit::context(&source.id, &source.source_type, payload)
            .with_param(PARAM_JOB_ID, job_id);
        let run = run_unit(unit, &ctx, &self.bus);
        if !run.is_success() {
            let (kind, message) = match &run.error {
                Some(e) => (e.kind(), e.to_string()),
                None => (ErrorKind::Terminal, run.status.to_string()),
            };
            return IngestOutcome::Failed {
                source_id: source.id.clone(),
                kind,
                message,
            };
        }

        let changed = run.output.metadata.get(META_CHANGED).map(String::as_str) == Some("true");
        self.bus.publish(TelemetryEvent::SourceFetched {
            source_id: source.id.clone(),
            changed,
        });
        debug!(source_id = %source.id, changed, "source ingested");

        IngestOutcome::Fetched {
            source_id: source.id.clone(),
            changed,
            previous_hash: run.output.metadata.get(META_PREVIOUS_HASH).cloned(),
            new_hash: run.output.metadata.get(META_HASH).cloned().unwrap_or_default(),
        }
    }
}
