//! Ingest unit: persists one fetched payload and registers its fingerprint.

use std::sync::Arc;

use tracing::debug;

use tipoff_core::{fingerprint, ResolveError, Resolver};
use tipoff_lineage::ContentRegistry;

use super::PARAM_JOB_ID;
use crate::error::UnitError;
use crate::sink::{ContentSink, PayloadMetadata};
use crate::unit::{Artifact, PipelineUnit, UnitContext, UnitOutput};

pub const PARAM_SOURCE_ID: &str = "source_id";
pub const PARAM_SOURCE_TYPE: &str = "source_type";
/// Input key of the fetched payload.
pub const INPUT_PAYLOAD: &str = "payload";

/// Output metadata keys.
pub const META_CHANGED: &str = "changed";
pub const META_HASH: &str = "content_hash";
pub const META_PREVIOUS_HASH: &str = "previous_hash";

pub struct IngestUnit {
    registry: Arc<ContentRegistry>,
    sink: Arc<dyn ContentSink>,
    force: bool,
}

impl IngestUnit {
    pub fn new(registry: Arc<ContentRegistry>, sink: Arc<dyn ContentSink>) -> Self {
        Self {
            registry,
            sink,
            force: false,
        }
    }

    pub fn from_resolver(resolver: &Resolver) -> Result<Self, ResolveError> {
        Ok(Self::new(
            resolver.resolve::<ContentRegistry>()?,
            resolver.resolve::<dyn ContentSink>()?,
        ))
    }

    /// Mark the source dirty even when its content did not change.
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Build the context for ingesting `payload` as `source_id`.
    pub fn context(source_id: &str, source_type: &str, payload: bytes::Bytes) -> UnitContext {
        UnitContext::new()
            .with_param(PARAM_SOURCE_ID, source_id)
            .with_param(PARAM_SOURCE_TYPE, source_type)
            .with_input(INPUT_PAYLOAD, Artifact::Bytes(payload))
    }
}

fn required_param<'a>(ctx: &'a UnitContext, key: &str) -> Result<&'a str, UnitError> {
    ctx.param(key)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| UnitError::Validation(format!("missing parameter '{key}'")))
}

impl PipelineUnit for IngestUnit {
    fn name(&self) -> &str {
        "ingest"
    }

    fn validate(&self, ctx: &UnitContext) -> Result<(), UnitError> {
        required_param(ctx, PARAM_SOURCE_ID)?;
        required_param(ctx, PARAM_SOURCE_TYPE)?;
        match ctx.input(INPUT_PAYLOAD) {
            Some(Artifact::Bytes(b)) if !b.is_empty() => Ok(()),
            Some(Artifact::Bytes(_)) => Err(UnitError::Validation("empty payload".into())),
            Some(Artifact::Json(_)) => Err(UnitError::Validation("payload must be raw bytes".into())),
            None => Err(UnitError::Validation("no payload".into())),
        }
    }

    fn execute(&self, ctx: &UnitContext) -> Result<UnitOutput, UnitError> {
        let source_id = required_param(ctx, PARAM_SOURCE_ID)?;
        let source_type = required_param(ctx, PARAM_SOURCE_TYPE)?;
        let payload = ctx
            .input(INPUT_PAYLOAD)
            .map(Artifact::to_bytes)
            .ok_or_else(|| UnitError::Validation("no payload".into()))?;
        let hash = fingerprint(&payload);

        // Payload first: a registered fingerprint always has its bytes in the sink.
        let known = self.registry.get(source_id)?.map(|r| r.content_hash);
        if known.as_deref() != Some(hash.as_str()) {
            let mut meta = PayloadMetadata::new(source_type, hash.as_str(), payload.len());
            if let Some(job) = ctx.param(PARAM_JOB_ID) {
                meta = meta.with_job(job);
            }
            self.sink.persist(source_id, &payload, &meta)?;
        }

        let registration = self.registry.register_fetch_tracked(source_id, source_type, &hash)?;
        if self.force && !registration.is_changed {
            self.registry.invalidate(source_id)?;
            debug!(source_id, "unchanged source forced dirty");
        }

        let mut output = UnitOutput::new()
            .with_artifact(source_id, Artifact::Bytes(payload))
            .with_metadata(META_CHANGED, registration.is_changed.to_string())
            .with_metadata(META_HASH, hash);
        if let Some(prev) = registration.previous_hash {
            output = output.with_metadata(META_PREVIOUS_HASH, prev);
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tipoff_core::{TelemetryBus, UnitStatus};

    use crate::sink::MemoryContentSink;
    use crate::unit::run_unit;

    fn unit() -> (IngestUnit, Arc<ContentRegistry>, Arc<MemoryContentSink>) {
        let registry = Arc::new(ContentRegistry::new());
        let sink = Arc::new(MemoryContentSink::new());
        let unit = IngestUnit::new(Arc::clone(&registry), sink.clone());
        (unit, registry, sink)
    }

    #[test]
    fn first_fetch_is_persisted_and_changed() {
        let (unit, registry, sink) = unit();
        let ctx = IngestUnit::context("scoreboard/2024-01-01", "scoreboard", Bytes::from_static(b"{}"));

        let out = unit.execute(&ctx).unwrap();

        assert_eq!(out.metadata[META_CHANGED], "true");
        assert!(registry.is_dirty("scoreboard/2024-01-01").unwrap());
        assert_eq!(sink.len(), 1);
    }

    #[test]
    fn refetch_of_same_content_is_unchanged() {
        let (unit, registry, _sink) = unit();
        let ctx = IngestUnit::context("s1", "teams", Bytes::from_static(b"[1,2]"));
        unit.execute(&ctx).unwrap();
        let hash = registry.get("s1").unwrap().unwrap().content_hash;
        registry.commit_processed("s1", &hash).unwrap();

        let out = unit.execute(&ctx).unwrap();
        assert_eq!(out.metadata[META_CHANGED], "false");
        assert_eq!(out.metadata[META_PREVIOUS_HASH], hash);
        assert!(!registry.is_dirty("s1").unwrap());
    }

    #[test]
    fn force_marks_unchanged_source_dirty() {
        let (unit, registry, _sink) = unit();
        let ctx = IngestUnit::context("s1", "teams", Bytes::from_static(b"[1]"));
        unit.execute(&ctx).unwrap();
        let hash = registry.get("s1").unwrap().unwrap().content_hash;
        registry.commit_processed("s1", &hash).unwrap();

        let forced = unit.with_force(true);
        forced.execute(&ctx).unwrap();
        assert!(registry.is_dirty("s1").unwrap());
    }

    #[test]
    fn empty_payload_fails_validation() {
        let (unit, registry, _sink) = unit();
        let ctx = IngestUnit::context("s1", "teams", Bytes::new());
        let run = run_unit(&unit, &ctx, &TelemetryBus::new());

        assert_eq!(run.status, UnitStatus::ValidationFailed);
        assert!(registry.is_empty());
    }

    #[test]
    fn resolves_from_registered_capabilities() {
        let resolver = Resolver::new();
        assert!(IngestUnit::from_resolver(&resolver).is_err());

        resolver.register(Arc::new(ContentRegistry::new())).unwrap();
        resolver
            .register::<dyn ContentSink>(Arc::new(MemoryContentSink::new()))
            .unwrap();
        assert!(IngestUnit::from_resolver(&resolver).is_ok());
    }
}
