use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Incremental sports-data pipeline runner.
///
/// Fetches configured sources under the adaptive governor, tracks content
/// fingerprints and recomputes only the derived nodes affected by a change.
#[derive(Parser, Debug)]
#[command(name = "tipoff", about = "Incremental sports-data pipeline runner")]
pub struct CliArgs {
    /// Path to config file (default: ./tipoff.toml, then ~/.config/tipoff/config.toml)
    #[arg(long, env = "TIPOFF_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Data directory override (registry, graph, job log and raw payloads)
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Print job records as JSON instead of a summary
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Fetch sources and register changed content
    Ingest {
        /// Only these source IDs (repeatable)
        #[arg(long = "source")]
        sources: Vec<String>,

        /// Only sources of this type
        #[arg(long = "type")]
        source_type: Option<String>,

        /// Mark fetched sources dirty even when their content is unchanged
        #[arg(long)]
        force: bool,
    },

    /// Recompute everything downstream of the given source or node IDs.
    /// Without IDs, every dirty source and stale node is used.
    Recompute { ids: Vec<String> },

    /// Ingest every source, then recompute whatever is dirty or stale
    Full,

    /// Show tracked sources, stale nodes and recent jobs
    Status {
        /// Number of recent jobs to list
        #[arg(long, default_value = "10")]
        jobs: usize,
    },

    /// Print the lineage graph in dependency order
    Graph,
}
