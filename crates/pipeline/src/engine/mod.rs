//! The engine: one value owning registry, graph, governor and bus, with the
//! three entry points `run_ingest`, `run_recompute` and `run_full`.
//!
//! Construction resolves every capability up front and seals the resolver,
//! so a missing provider fails before any job starts.

mod ingest;
mod recompute;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, error, info, warn};

use tipoff_core::{
    EngineConfig, JobRecord, JobStatus, LineageNode, NodeId, Resolver, TelemetryBus,
    TelemetryEvent,
};
use tipoff_governor::{FetchClient, FetchGovernor, HttpFetchClient, RetryPolicy};
use tipoff_lineage::{
    ContentRegistry, FsLineageStore, LineageGraph, LineageStore, MemoryLineageStore,
};

use crate::compose::CancelFlag;
use crate::error::EngineError;
use crate::sink::{ContentSink, FsContentSink, MemoryContentSink};
use crate::unit::PipelineUnit;
use crate::units::DigestUnit;

pub use ingest::{IngestOptions, SourceFilter};

/// Failure entries listed in a job's error summary before it is truncated.
const SUMMARY_LIMIT: usize = 5;

pub struct Engine {
    config: EngineConfig,
    registry: Arc<ContentRegistry>,
    graph: Arc<LineageGraph>,
    governor: Arc<FetchGovernor>,
    bus: Arc<TelemetryBus>,
    resolver: Resolver,
    client: Arc<dyn FetchClient>,
    sink: Arc<dyn ContentSink>,
    store: Arc<dyn LineageStore>,
    units: RwLock<HashMap<NodeId, Arc<dyn PipelineUnit>>>,
    retry: RetryPolicy,
    cancel: CancelFlag,
}

/// Assembles an [`Engine`]. Anything not supplied is derived from the config:
/// an HTTP fetch client, filesystem sink and store under `storage.data_dir`
/// (in-memory without one), and a [`DigestUnit`] for every node without an
/// explicit binding.
pub struct EngineBuilder {
    config: EngineConfig,
    bus: Option<Arc<TelemetryBus>>,
    client: Option<Arc<dyn FetchClient>>,
    sink: Option<Arc<dyn ContentSink>>,
    store: Option<Arc<dyn LineageStore>>,
    bindings: Vec<(NodeId, Arc<dyn PipelineUnit>)>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            bus: None,
            client: None,
            sink: None,
            store: None,
            bindings: Vec::new(),
        }
    }

    pub fn with_telemetry(mut self, bus: Arc<TelemetryBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_fetch_client(mut self, client: Arc<dyn FetchClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn ContentSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn LineageStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Bind a custom unit to a node instead of the default digest.
    pub fn bind(mut self, node_id: impl Into<NodeId>, unit: Arc<dyn PipelineUnit>) -> Self {
        self.bindings.push((node_id.into(), unit));
        self
    }

    pub fn build(self) -> Result<Engine, EngineError> {
        let config = self.config;
        config.validate()?;

        let bus = self
            .bus
            .unwrap_or_else(|| Arc::new(TelemetryBus::with_logging()));

        let store: Arc<dyn LineageStore> = match (self.store, config.storage.lineage_dir()) {
            (Some(store), _) => store,
            (None, Some(dir)) => Arc::new(FsLineageStore::new(dir)?),
            (None, None) => Arc::new(MemoryLineageStore::new()),
        };

        let registry = match store.load_registry()? {
            Some(snapshot) => ContentRegistry::from_snapshot(snapshot),
            None => ContentRegistry::new(),
        };
        let graph = match store.load_graph()? {
            Some(snapshot) => LineageGraph::from_snapshot(snapshot)?,
            None => LineageGraph::new(),
        };
        for node in &config.nodes {
            graph.upsert(
                LineageNode::new(node.id.as_str(), node.kind, node.depends_on.clone())
                    .with_generator_version(node.generator_version),
            )?;
        }

        let resolver = Resolver::new();
        match self.client {
            Some(client) => resolver.register::<dyn FetchClient>(client)?,
            None => {
                let client = HttpFetchClient::new(&config.fetch).map_err(|e| {
                    EngineError::Config(tipoff_core::TipoffError::Config(e.to_string()))
                })?;
                resolver.register::<dyn FetchClient>(Arc::new(client))?;
            }
        }
        match (self.sink, config.storage.raw_dir()) {
            (Some(sink), _) => resolver.register::<dyn ContentSink>(sink)?,
            (None, Some(dir)) => {
                resolver.register::<dyn ContentSink>(Arc::new(FsContentSink::new(dir)?))?
            }
            (None, None) => resolver.register_default::<dyn ContentSink, _>(|| {
                Arc::new(MemoryContentSink::new()) as Arc<dyn ContentSink>
            })?,
        }
        resolver.register(Arc::new(registry))?;
        resolver.register(Arc::new(graph))?;
        resolver.register(Arc::clone(&bus))?;
        resolver.seal();

        let client = resolver.resolve::<dyn FetchClient>()?;
        let sink = resolver.resolve::<dyn ContentSink>()?;
        let registry = resolver.resolve::<ContentRegistry>()?;
        let graph = resolver.resolve::<LineageGraph>()?;

        let mut units: HashMap<NodeId, Arc<dyn PipelineUnit>> = self.bindings.into_iter().collect();
        for node in graph.snapshot()?.nodes {
            if !units.contains_key(&node.node_id) {
                let unit = DigestUnit::from_resolver(&node, &resolver)?;
                units.insert(node.node_id.clone(), Arc::new(unit));
            }
        }

        let governor = Arc::new(
            FetchGovernor::new(config.governor.clone()).with_telemetry(Arc::clone(&bus)),
        );

        info!(
            sources = config.sources.len(),
            nodes = graph.len(),
            tracked = registry.len(),
            client = client.client_name(),
            sink = sink.sink_name(),
            "engine ready"
        );

        Ok(Engine {
            retry: RetryPolicy::from_config(&config.retry),
            config,
            registry,
            graph,
            governor,
            bus,
            resolver,
            client,
            sink,
            store,
            units: RwLock::new(units),
            cancel: CancelFlag::new(),
        })
    }
}

impl Engine {
    /// Engine with every capability derived from `config`.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        EngineBuilder::new(config).build()
    }

    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ContentRegistry> {
        &self.registry
    }

    pub fn graph(&self) -> &Arc<LineageGraph> {
        &self.graph
    }

    pub fn governor(&self) -> &Arc<FetchGovernor> {
        &self.governor
    }

    pub fn bus(&self) -> &Arc<TelemetryBus> {
        &self.bus
    }

    pub fn sink(&self) -> &Arc<dyn ContentSink> {
        &self.sink
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    /// Handle for cancelling the running job from another task or a signal
    /// handler. The flag is cleared when the next job starts, so a cancel
    /// only ever stops the job in flight.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Declare or update a derived node after construction. Without an
    /// explicit unit the node gets the default digest.
    pub fn add_node(
        &self,
        node: LineageNode,
        unit: Option<Arc<dyn PipelineUnit>>,
    ) -> Result<(), EngineError> {
        self.graph.upsert(node.clone())?;
        let unit = match unit {
            Some(unit) => unit,
            None => Arc::new(DigestUnit::new(&node, Arc::clone(&self.sink))),
        };
        self.bind(&node.node_id, unit)
    }

    /// Replace the unit bound to `node_id`.
    pub fn bind(&self, node_id: &str, unit: Arc<dyn PipelineUnit>) -> Result<(), EngineError> {
        self.units
            .write()
            .map_err(|e| tipoff_lineage::StorageError::LockPoisoned(format!("unit bindings: {e}")))?
            .insert(node_id.to_string(), unit);
        Ok(())
    }

    fn unit_for(&self, node_id: &str) -> Option<Arc<dyn PipelineUnit>> {
        self.units
            .read()
            .ok()
            .and_then(|units| units.get(node_id).cloned())
    }

    /// Write graph and registry to the lineage store.
    pub fn persist(&self) -> Result<(), EngineError> {
        self.store.save_graph(&self.graph.snapshot()?)?;
        self.store.save_registry(&self.registry.snapshot()?)?;
        Ok(())
    }

    /// Job audit trail, oldest first.
    pub fn jobs(&self) -> Result<Vec<JobRecord>, EngineError> {
        Ok(self.store.load_jobs()?)
    }

    fn start_job(&self, job: &JobRecord) {
        if self.cancel.is_cancelled() {
            debug!(job_id = %job.job_id, "clearing cancellation left by a previous job");
            self.cancel.reset();
        }
        self.bus.publish(TelemetryEvent::JobStarted {
            job_id: job.job_id,
            job_type: job.job_type,
        });
    }

    /// Persist state, seal the record and append it to the audit trail.
    ///
    /// A store failure turns the job into `Failed`; the partial record is
    /// still returned to the caller.
    fn finish_job(&self, job: &mut JobRecord, mut status: JobStatus) {
        if let Err(e) = self.persist() {
            error!(job_id = %job.job_id, error = %e, "failed to persist lineage state");
            job.record_failure("lineage_store", &e.kind().to_string(), &e.to_string());
            status = JobStatus::Failed;
        }
        let summary = summarize(job);
        job.seal(status, summary);

        if let Err(e) = self.store.append_job(job) {
            error!(job_id = %job.job_id, error = %e, "failed to append job record");
        }
        self.bus.publish(TelemetryEvent::JobFinished {
            job_id: job.job_id,
            status,
        });
        match status {
            JobStatus::Success => info!(
                job_id = %job.job_id,
                job_type = %job.job_type,
                executed = job.executed_nodes.len(),
                changes = job.changes.len(),
                duration_ms = job.duration_ms().unwrap_or_default(),
                "job succeeded"
            ),
            _ => warn!(
                job_id = %job.job_id,
                job_type = %job.job_type,
                status = ?status,
                failures = job.failures.len(),
                "job did not fully succeed"
            ),
        }
    }
}

/// The more severe of two statuses.
pub(crate) fn worst(a: JobStatus, b: JobStatus) -> JobStatus {
    fn rank(s: JobStatus) -> u8 {
        match s {
            JobStatus::Success => 0,
            JobStatus::PartialFailure => 1,
            JobStatus::Failed => 2,
        }
    }
    if rank(b) > rank(a) {
        b
    } else {
        a
    }
}

fn summarize(job: &JobRecord) -> Option<String> {
    if job.failures.is_empty() {
        return None;
    }
    let mut parts: Vec<String> = job
        .failures
        .iter()
        .take(SUMMARY_LIMIT)
        .map(|f| format!("{} ({})", f.id, f.kind))
        .collect();
    if job.failures.len() > SUMMARY_LIMIT {
        parts.push(format!("+{} more", job.failures.len() - SUMMARY_LIMIT));
    }
    Some(format!("{} failed: {}", job.failures.len(), parts.join(", ")))
}
