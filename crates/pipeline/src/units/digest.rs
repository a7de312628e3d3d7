//! Digest unit: the default generator bound to declared lineage nodes.
//!
//! A node's artifact is a JSON document carrying a fingerprint over the node
//! identity, its generator version and every input payload, in declaration
//! order. Inputs come from the run context when an upstream node ran in the
//! same job, otherwise from the content sink.

use std::sync::Arc;

use bytes::Bytes;
use serde_json::json;
use tracing::debug;

use tipoff_core::{fingerprint, fingerprint_parts, LineageNode, NodeId, NodeKind, ResolveError, Resolver};

use super::PARAM_JOB_ID;
use crate::error::UnitError;
use crate::sink::{ContentSink, PayloadMetadata};
use crate::unit::{Artifact, PipelineUnit, UnitContext, UnitOutput};

pub struct DigestUnit {
    node_id: NodeId,
    kind: NodeKind,
    depends_on: Vec<String>,
    generator_version: u32,
    sink: Arc<dyn ContentSink>,
}

impl DigestUnit {
    pub fn new(node: &LineageNode, sink: Arc<dyn ContentSink>) -> Self {
        Self {
            node_id: node.node_id.clone(),
            kind: node.node_kind,
            depends_on: node.depends_on.clone(),
            generator_version: node.generator_version,
            sink,
        }
    }

    pub fn from_resolver(node: &LineageNode, resolver: &Resolver) -> Result<Self, ResolveError> {
        Ok(Self::new(node, resolver.resolve::<dyn ContentSink>()?))
    }

    fn gather_inputs(&self, ctx: &UnitContext) -> Result<Vec<(String, Bytes)>, UnitError> {
        let mut inputs = Vec::with_capacity(self.depends_on.len());
        for dep in &self.depends_on {
            let payload = match ctx.input(dep) {
                Some(artifact) => artifact.to_bytes(),
                None => match self.sink.read_latest(dep)? {
                    Some(stored) => stored.payload,
                    None => {
                        return Err(UnitError::Validation(format!("input '{dep}' is not available")))
                    }
                },
            };
            inputs.push((dep.clone(), payload));
        }
        Ok(inputs)
    }
}

impl PipelineUnit for DigestUnit {
    fn name(&self) -> &str {
        &self.node_id
    }

    /// Every input must exist and be a JSON document.
    fn validate(&self, ctx: &UnitContext) -> Result<(), UnitError> {
        for (dep, payload) in self.gather_inputs(ctx)? {
            if serde_json::from_slice::<serde_json::Value>(&payload).is_err() {
                return Err(UnitError::Validation(format!("input '{dep}' is not valid JSON")));
            }
        }
        Ok(())
    }

    fn execute(&self, ctx: &UnitContext) -> Result<UnitOutput, UnitError> {
        let inputs = self.gather_inputs(ctx)?;

        let version = self.generator_version.to_string();
        let mut parts: Vec<&[u8]> = vec![self.node_id.as_bytes(), version.as_bytes()];
        for (dep, payload) in &inputs {
            parts.push(dep.as_bytes());
            parts.push(payload);
        }
        let digest = fingerprint_parts(parts);

        let input_hashes: serde_json::Map<String, serde_json::Value> = inputs
            .iter()
            .map(|(dep, payload)| (dep.clone(), json!(fingerprint(payload))))
            .collect();
        let document = json!({
            "node_id": self.node_id,
            "kind": self.kind,
            "generator_version": self.generator_version,
            "digest": digest,
            "inputs": input_hashes,
        });

        let bytes = Bytes::from(document.to_string());
        let mut meta = PayloadMetadata::new(self.kind.to_string(), fingerprint(&bytes), bytes.len());
        if let Some(job) = ctx.param(PARAM_JOB_ID) {
            meta = meta.with_job(job);
        }
        self.sink.persist(&self.node_id, &bytes, &meta)?;
        debug!(node = %self.node_id, digest = %digest, inputs = inputs.len(), "node artifact written");

        Ok(UnitOutput::new()
            .with_artifact(self.node_id.clone(), Artifact::Json(document))
            .with_metadata("digest", digest))
    }
}
