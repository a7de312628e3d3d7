mod cli;
mod config;
mod terminal;

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use tipoff_core::{load_dotenv, JobRecord, JobStatus};
use tipoff_pipeline::{Engine, EngineError, IngestOptions, SourceFilter};

use crate::cli::{CliArgs, Command};
use crate::terminal::Terminal;

/// Exit status for a run that could not start or failed fatally.
const EXIT_FATAL: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    load_dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = CliArgs::parse();
    let terminal = Terminal::new(args.json);

    match run(args, &terminal).await {
        Ok(code) => code,
        Err(e) => {
            let kind = e
                .downcast_ref::<EngineError>()
                .map(|engine| engine.kind().to_string());
            error!(error = %e, kind = ?kind, "tipoff failed");
            let message = match kind {
                Some(kind) => format!("[{kind}] {e:#}"),
                None => format!("{e:#}"),
            };
            terminal.print_error(&message).ok();
            ExitCode::from(EXIT_FATAL)
        }
    }
}

async fn run(args: CliArgs, terminal: &Terminal) -> Result<ExitCode> {
    let config = config::load(args.config.as_deref(), args.data_dir.clone())?;
    config.log_summary();

    let engine = Engine::new(config)?;
    watch_ctrl_c(&engine);

    match args.command {
        Command::Ingest {
            sources,
            source_type,
            force,
        } => {
            let mut filter = if sources.is_empty() {
                SourceFilter::all()
            } else {
                SourceFilter::ids(sources)
            };
            if let Some(source_type) = source_type {
                filter = filter.of_type(source_type);
            }
            let job = engine.run_ingest(&filter, IngestOptions { force }).await;
            finish(terminal, &job)
        }
        Command::Recompute { ids } => {
            let ids = if ids.is_empty() {
                let mut roots = engine.registry().list_dirty(None)?;
                roots.extend(engine.graph().stale_nodes(engine.registry())?);
                roots
            } else {
                ids
            };
            if ids.is_empty() {
                terminal.print_info("Nothing dirty, nothing to recompute.")?;
                return Ok(ExitCode::SUCCESS);
            }
            let job = tokio::task::block_in_place(|| engine.run_recompute(&ids[..]));
            finish(terminal, &job)
        }
        Command::Full => {
            let job = engine.run_full().await;
            finish(terminal, &job)
        }
        Command::Status { jobs } => {
            let sources = engine.registry().list(None)?;
            let stale = engine.graph().stale_nodes(engine.registry())?;
            let mut history = engine.jobs()?;
            let recent = history.split_off(history.len().saturating_sub(jobs));
            terminal.print_status(&sources, &stale, &recent)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Graph => {
            let graph = engine.graph();
            let mut nodes = Vec::with_capacity(graph.len());
            for id in graph.full_order()? {
                let node = graph
                    .node(&id)?
                    .with_context(|| format!("node {id} vanished while listing"))?;
                nodes.push(node);
            }
            terminal.print_graph(&nodes)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Ctrl-C stops dispatching new work; running items finish and the job is
/// still sealed and persisted.
fn watch_ctrl_c(engine: &Engine) {
    let flag = engine.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling after in-flight work");
            flag.cancel();
        }
    });
}

fn finish(terminal: &Terminal, job: &JobRecord) -> Result<ExitCode> {
    terminal.print_job(job)?;
    let code = exit_code(job.status);
    info!(job_id = %job.job_id, exit_code = code, "done");
    Ok(ExitCode::from(code))
}

/// 0 success (including nothing to do), 1 partial failure, 2 fatal.
fn exit_code(status: Option<JobStatus>) -> u8 {
    match status {
        Some(JobStatus::Success) => 0,
        Some(JobStatus::PartialFailure) => 1,
        Some(JobStatus::Failed) | None => EXIT_FATAL,
    }
}
