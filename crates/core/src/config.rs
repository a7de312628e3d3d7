use std::collections::{BTreeMap, HashSet};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::TipoffError;
use crate::types::NodeKind;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_opt(key).and_then(|v| v.parse().ok())
}

// ── Top-level config ──────────────────────────────────────────

/// Engine configuration, parsed from `tipoff.toml`.
///
/// Environment variables override file values after parsing; validation runs
/// last so overrides are checked too.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub governor: GovernorConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub composition: CompositionConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    /// Source units the ingest entry point fetches.
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    /// Derived nodes declared up front.
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
}

impl EngineConfig {
    /// Parse config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, TipoffError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, TipoffError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Defaults plus environment overrides, for runs without a config file.
    pub fn from_env() -> Result<Self, TipoffError> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides.
    ///
    /// Convention: `TIPOFF_SECTION_KEY` overrides `section.key`, e.g.
    /// `TIPOFF_GOVERNOR_MAX_CONCURRENCY` or `TIPOFF_STORAGE_DATA_DIR`.
    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = env_parse("TIPOFF_GOVERNOR_INITIAL_CONCURRENCY") {
            self.governor.initial_concurrency = v;
        }
        if let Some(v) = env_parse("TIPOFF_GOVERNOR_MAX_CONCURRENCY") {
            self.governor.max_concurrency = v;
        }
        if let Some(v) = env_parse("TIPOFF_GOVERNOR_INITIAL_DELAY_MS") {
            self.governor.initial_delay_ms = v;
        }
        if let Some(v) = env_parse("TIPOFF_GOVERNOR_MAX_DELAY_MS") {
            self.governor.max_delay_ms = v;
        }
        if let Some(v) = env_parse("TIPOFF_RETRY_MAX_ATTEMPTS") {
            self.retry.max_attempts = v;
        }
        if let Some(v) = env_parse("TIPOFF_COMPOSITION_WORKER_LIMIT") {
            self.composition.worker_limit = v;
        }
        if let Some(v) = env_opt("TIPOFF_STORAGE_DATA_DIR") {
            self.storage.data_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = env_opt("TIPOFF_FETCH_BASE_URL") {
            self.fetch.base_url = v;
        }
        if let Some(v) = env_parse("TIPOFF_FETCH_TIMEOUT_SECS") {
            self.fetch.timeout_secs = v;
        }
    }

    /// Validate bounds and declarations.
    pub fn validate(&self) -> Result<(), TipoffError> {
        self.governor.validate()?;
        self.retry.validate()?;
        self.validate_sources()?;
        self.validate_nodes()?;
        Ok(())
    }

    fn validate_sources(&self) -> Result<(), TipoffError> {
        let mut seen = HashSet::new();
        for source in &self.sources {
            if source.id.is_empty() {
                return Err(TipoffError::Config("source with empty id".into()));
            }
            if !seen.insert(source.id.as_str()) {
                return Err(TipoffError::Config(format!(
                    "duplicate source id '{}'",
                    source.id
                )));
            }
        }
        Ok(())
    }

    /// Every node dependency must name a declared source or node.
    fn validate_nodes(&self) -> Result<(), TipoffError> {
        let mut known: HashSet<&str> = self.sources.iter().map(|s| s.id.as_str()).collect();
        for node in &self.nodes {
            if !known.insert(node.id.as_str()) {
                return Err(TipoffError::Config(format!(
                    "node id '{}' is declared twice or shadows a source",
                    node.id
                )));
            }
        }
        for node in &self.nodes {
            for dep in &node.depends_on {
                if !known.contains(dep.as_str()) {
                    return Err(TipoffError::Config(format!(
                        "node '{}' depends on unknown id '{dep}'",
                        node.id
                    )));
                }
            }
        }
        Ok(())
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded:");
        tracing::info!(
            "  governor:    concurrency={}..={} (start {}), delay={}ms..{}ms",
            1,
            self.governor.max_concurrency,
            self.governor.initial_concurrency,
            self.governor.min_delay_ms,
            self.governor.max_delay_ms
        );
        tracing::info!("  retry:       max_attempts={}", self.retry.max_attempts);
        tracing::info!(
            "  composition: workers={}",
            self.composition.resolved_worker_limit()
        );
        match &self.storage.data_dir {
            Some(dir) => tracing::info!("  storage:     data_dir={}", dir.display()),
            None => tracing::info!("  storage:     in-memory"),
        }
        tracing::info!("  fetch:       base_url={}", self.fetch.base_url);
        tracing::info!(
            "  lineage:     {} sources, {} nodes",
            self.sources.len(),
            self.nodes.len()
        );
    }
}

// ── Governor ──────────────────────────────────────────────────

/// AIMD parameters for the adaptive fetch governor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernorConfig {
    #[serde(default = "default_initial_concurrency")]
    pub initial_concurrency: usize,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Consecutive successes before an additive increase.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    /// Consecutive rate-limit-like errors before a multiplicative decrease.
    #[serde(default = "default_error_threshold")]
    pub error_threshold: u32,
    /// Delay multiplier on increase (< 1).
    #[serde(default = "default_recovery_factor")]
    pub recovery_factor: f64,
    /// Delay multiplier on decrease (> 1).
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
}

fn default_initial_concurrency() -> usize { 4 }
fn default_max_concurrency() -> usize { 16 }
fn default_initial_delay_ms() -> u64 { 250 }
fn default_min_delay_ms() -> u64 { 10 }
fn default_max_delay_ms() -> u64 { 30_000 }
fn default_success_threshold() -> u32 { 5 }
fn default_error_threshold() -> u32 { 2 }
fn default_recovery_factor() -> f64 { 0.8 }
fn default_backoff_factor() -> f64 { 2.0 }

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            initial_concurrency: default_initial_concurrency(),
            max_concurrency: default_max_concurrency(),
            initial_delay_ms: default_initial_delay_ms(),
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            success_threshold: default_success_threshold(),
            error_threshold: default_error_threshold(),
            recovery_factor: default_recovery_factor(),
            backoff_factor: default_backoff_factor(),
        }
    }
}

impl GovernorConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn validate(&self) -> Result<(), TipoffError> {
        if self.max_concurrency == 0 {
            return Err(TipoffError::Config("governor.max_concurrency must be >= 1".into()));
        }
        if self.initial_concurrency == 0 || self.initial_concurrency > self.max_concurrency {
            return Err(TipoffError::Config(format!(
                "governor.initial_concurrency must be in 1..={}",
                self.max_concurrency
            )));
        }
        if self.min_delay_ms > self.max_delay_ms {
            return Err(TipoffError::Config(
                "governor.min_delay_ms must not exceed governor.max_delay_ms".into(),
            ));
        }
        if self.success_threshold == 0 || self.error_threshold == 0 {
            return Err(TipoffError::Config("governor thresholds must be >= 1".into()));
        }
        if !(self.recovery_factor > 0.0 && self.recovery_factor < 1.0) {
            return Err(TipoffError::Config(
                "governor.recovery_factor must be in (0, 1)".into(),
            ));
        }
        if self.backoff_factor.is_nan() || self.backoff_factor <= 1.0 {
            return Err(TipoffError::Config("governor.backoff_factor must be > 1".into()));
        }
        Ok(())
    }
}

// ── Retry ─────────────────────────────────────────────────────

/// Per-item retry budget applied on top of the governor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_retry_factor")]
    pub backoff_factor: f64,
    /// Upper bound on a single backoff wait.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 { 3 }
fn default_base_backoff_ms() -> u64 { 500 }
fn default_retry_factor() -> f64 { 2.0 }
fn default_max_backoff_ms() -> u64 { 60_000 }

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            backoff_factor: default_retry_factor(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), TipoffError> {
        if self.max_attempts == 0 {
            return Err(TipoffError::Config("retry.max_attempts must be >= 1".into()));
        }
        if self.backoff_factor.is_nan() || self.backoff_factor < 1.0 {
            return Err(TipoffError::Config("retry.backoff_factor must be >= 1".into()));
        }
        if self.base_backoff_ms > self.max_backoff_ms {
            return Err(TipoffError::Config(
                "retry.base_backoff_ms must not exceed retry.max_backoff_ms".into(),
            ));
        }
        Ok(())
    }
}

// ── Composition ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositionConfig {
    /// Graph composition worker pool size. 0 = available parallelism.
    #[serde(default)]
    pub worker_limit: usize,
}

impl Default for CompositionConfig {
    fn default() -> Self {
        Self { worker_limit: 0 }
    }
}

impl CompositionConfig {
    /// Resolve worker count (0 means use available parallelism).
    pub fn resolved_worker_limit(&self) -> usize {
        if self.worker_limit == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            self.worker_limit
        }
    }
}

// ── Storage ───────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root for the lineage store and content sink. `None` keeps state in memory.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

impl StorageConfig {
    pub fn lineage_dir(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|d| d.join("lineage"))
    }

    pub fn raw_dir(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|d| d.join("raw"))
    }
}

// ── Fetch ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_base_url() -> String {
    "http://site.api.espn.com/apis/site/v2/sports/basketball/mens-college-basketball".into()
}
fn default_timeout_secs() -> u64 { 30 }
fn default_user_agent() -> String {
    concat!("tipoff/", env!("CARGO_PKG_VERSION")).into()
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

// ── Lineage declarations ──────────────────────────────────────

/// A source unit to fetch, relative to `fetch.base_url`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    pub source_type: String,
    pub path: String,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
}

/// A derived node declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: String,
    pub kind: NodeKind,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default = "default_generator_version")]
    pub generator_version: u32,
}

fn default_generator_version() -> u32 { 1 }

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
