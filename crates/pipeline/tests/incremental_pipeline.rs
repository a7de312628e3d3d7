//! End-to-end runs over a filesystem data directory: ingest, targeted
//! recompute, and a restart that picks up persisted lineage state.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;

use tipoff_core::{EngineConfig, JobStatus, JobType, TelemetryBus};
use tipoff_governor::{FetchClient, FetchError, FetchRequest};
use tipoff_pipeline::{
    Artifact, Engine, FnUnit, IngestOptions, MetricsObserver, SourceFilter, UnitContext,
    UnitOutput,
};

/// Upstream data keyed by request path.
#[derive(Default)]
struct Scoreboard {
    pages: Mutex<HashMap<String, String>>,
}

impl Scoreboard {
    fn publish(&self, path: &str, body: serde_json::Value) {
        self.pages
            .lock()
            .unwrap()
            .insert(path.to_string(), body.to_string());
    }
}

#[async_trait]
impl FetchClient for Scoreboard {
    async fn fetch(&self, request: &FetchRequest) -> Result<Bytes, FetchError> {
        self.pages
            .lock()
            .unwrap()
            .get(&request.path)
            .map(|body| Bytes::from(body.clone()))
            .ok_or(FetchError::Client {
                status: 404,
                message: request.path.clone(),
            })
    }
}

fn config(data_dir: &Path) -> EngineConfig {
    let toml = format!(
        r#"
[governor]
initial_delay_ms = 0
min_delay_ms = 0

[retry]
base_backoff_ms = 1

[storage]
data_dir = "{}"

[[sources]]
id = "game-1"
source_type = "boxscore"
path = "games/1/boxscore"

[[sources]]
id = "game-2"
source_type = "boxscore"
path = "games/2/boxscore"

[[sources]]
id = "roster"
source_type = "roster"
path = "teams/roster"

[[nodes]]
id = "games"
kind = "entity"
depends_on = ["game-1", "game-2"]

[[nodes]]
id = "players"
kind = "entity"
depends_on = ["roster"]

[[nodes]]
id = "form"
kind = "feature"
depends_on = ["games", "players"]

[[nodes]]
id = "win_prob"
kind = "model"
depends_on = ["form"]
"#,
        data_dir.display()
    );
    EngineConfig::from_toml(&toml).unwrap()
}

fn upstream() -> Arc<Scoreboard> {
    let board = Arc::new(Scoreboard::default());
    board.publish("games/1/boxscore", json!({"home": 101, "away": 99}));
    board.publish("games/2/boxscore", json!({"home": 88, "away": 90}));
    board.publish("teams/roster", json!({"players": ["a", "b"]}));
    board
}

fn names(ids: &[String]) -> Vec<&str> {
    ids.iter().map(String::as_str).collect()
}

#[tokio::test]
async fn changed_source_recomputes_only_its_closure() {
    let dir = tempfile::tempdir().unwrap();
    let board = upstream();
    let metrics = Arc::new(MetricsObserver::new());
    let bus = Arc::new(TelemetryBus::new());
    bus.subscribe(metrics.clone());

    let engine = Engine::builder(config(dir.path()))
        .with_fetch_client(board.clone())
        .with_telemetry(bus)
        .build()
        .unwrap();

    let first = engine.run_full().await;
    assert_eq!(first.status, Some(JobStatus::Success));
    assert_eq!(first.job_type, JobType::Full);
    assert_eq!(names(&first.executed_nodes), ["games", "players", "form", "win_prob"]);
    assert_eq!(metrics.snapshot().sources_fetched, 3);

    board.publish("games/2/boxscore", json!({"home": 88, "away": 91}));
    let ingest = engine
        .run_ingest(&SourceFilter::all().of_type("boxscore"), IngestOptions::default())
        .await;
    assert_eq!(ingest.changes.len(), 1);
    let change = &ingest.changes[0];
    assert_eq!(change.source_id, "game-2");
    assert!(change.old_hash.is_some());
    assert_eq!(names(&change.affected_node_ids), ["games", "form", "win_prob"]);

    let dirty = engine.registry().list_dirty(None).unwrap();
    assert_eq!(dirty, vec!["game-2".to_string()]);

    let recompute = engine.run_recompute(&dirty[..]);
    assert_eq!(recompute.status, Some(JobStatus::Success));
    assert_eq!(names(&recompute.executed_nodes), ["games", "form", "win_prob"]);
    assert!(engine.registry().list_dirty(None).unwrap().is_empty());

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.runs["players"], 1);
    assert_eq!(snapshot.runs["win_prob"], 2);
    assert_eq!(snapshot.sources_changed, 4);
}

#[tokio::test]
async fn restart_resumes_from_persisted_state() {
    let dir = tempfile::tempdir().unwrap();
    let board = upstream();

    {
        let engine = Engine::builder(config(dir.path()))
            .with_fetch_client(board.clone())
            .build()
            .unwrap();
        engine.run_ingest(&SourceFilter::all(), IngestOptions::default()).await;
        // Interrupted before recompute: sources stay dirty across the restart.
    }

    let engine = Engine::builder(config(dir.path()))
        .with_fetch_client(board.clone())
        .build()
        .unwrap();
    assert_eq!(engine.registry().list_dirty(None).unwrap().len(), 3);

    let job = engine.run_full().await;
    assert_eq!(job.status, Some(JobStatus::Success));
    assert!(job.changes.iter().all(|c| c.old_hash.is_none()));
    assert_eq!(job.executed_nodes.len(), 4);

    let model = engine.sink().read_latest("win_prob").unwrap().unwrap();
    assert_eq!(model.metadata.content_type, "model");
    assert_eq!(model.metadata.job_id, Some(job.job_id.to_string()));

    let jobs = engine.jobs().unwrap();
    assert_eq!(
        jobs.iter().map(|j| j.job_type).collect::<Vec<_>>(),
        vec![JobType::Ingest, JobType::Full]
    );
}

#[tokio::test]
async fn bound_units_replace_the_default_digest() {
    let dir = tempfile::tempdir().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();

    let engine = Engine::builder(config(dir.path()))
        .with_fetch_client(upstream())
        .bind(
            "form",
            Arc::new(FnUnit::new("form", move |ctx: &UnitContext| {
                seen.fetch_add(1, Ordering::SeqCst);
                let games = ctx.input("games").and_then(Artifact::as_json).cloned();
                Ok(UnitOutput::new().with_artifact(
                    "form",
                    Artifact::Json(json!({"rolling": 3, "games": games})),
                ))
            })),
        )
        .build()
        .unwrap();

    let job = engine.run_full().await;
    assert_eq!(job.status, Some(JobStatus::Success));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(engine.graph().stale_nodes(engine.registry()).unwrap().is_empty());
}
