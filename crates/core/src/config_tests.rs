use super::*;

const SAMPLE: &str = r#"
[governor]
initial_concurrency = 2
max_concurrency = 8
initial_delay_ms = 100

[composition]
worker_limit = 3

[storage]
data_dir = "/tmp/tipoff-test"

[[sources]]
id = "scoreboard/2024-03-01"
source_type = "scoreboard"
path = "scoreboard"
query = { dates = "20240301" }

[[sources]]
id = "teams"
source_type = "teams"
path = "teams"

[[nodes]]
id = "games"
kind = "entity"
depends_on = ["scoreboard/2024-03-01", "teams"]

[[nodes]]
id = "team_efficiency"
kind = "feature"
depends_on = ["games"]
generator_version = 2
"#;

#[test]
fn parse_sample_config() {
    let config = EngineConfig::from_toml(SAMPLE).unwrap();

    assert_eq!(config.governor.initial_concurrency, 2);
    assert_eq!(config.governor.max_concurrency, 8);
    assert_eq!(config.governor.initial_delay(), Duration::from_millis(100));
    // Unset fields fall back to defaults
    assert_eq!(config.governor.success_threshold, 5);
    assert_eq!(config.composition.resolved_worker_limit(), 3);
    assert_eq!(config.sources.len(), 2);
    assert_eq!(config.sources[0].query["dates"], "20240301");
    assert_eq!(config.nodes[1].kind, NodeKind::Feature);
    assert_eq!(config.nodes[1].generator_version, 2);
    assert_eq!(config.nodes[0].generator_version, 1);
    assert_eq!(
        config.storage.lineage_dir(),
        Some(PathBuf::from("/tmp/tipoff-test/lineage"))
    );
}

#[test]
fn empty_config_uses_defaults() {
    let config = EngineConfig::from_toml("").unwrap();
    assert_eq!(config.governor.max_concurrency, 16);
    assert_eq!(config.retry.max_attempts, 3);
    assert!(config.storage.data_dir.is_none());
    assert!(config.composition.resolved_worker_limit() > 0);
}

#[test]
fn rejects_inverted_concurrency_bounds() {
    let err = EngineConfig::from_toml(
        r#"
[governor]
initial_concurrency = 10
max_concurrency = 4
"#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("initial_concurrency"));
}

#[test]
fn rejects_bad_factors() {
    let mut governor = GovernorConfig::default();
    governor.recovery_factor = 1.2;
    assert!(governor.validate().is_err());

    let mut governor = GovernorConfig::default();
    governor.backoff_factor = 0.5;
    assert!(governor.validate().is_err());

    let mut governor = GovernorConfig::default();
    governor.min_delay_ms = 5_000;
    governor.max_delay_ms = 1_000;
    assert!(governor.validate().is_err());
}

#[test]
fn rejects_unknown_node_dependency() {
    let err = EngineConfig::from_toml(
        r#"
[[nodes]]
id = "games"
kind = "entity"
depends_on = ["missing"]
"#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("unknown id 'missing'"));
}

#[test]
fn rejects_duplicate_sources() {
    let err = EngineConfig::from_toml(
        r#"
[[sources]]
id = "teams"
source_type = "teams"
path = "teams"

[[sources]]
id = "teams"
source_type = "teams"
path = "teams"
"#,
    )
    .unwrap_err();
    assert!(matches!(err, TipoffError::Config(_)));
}

#[test]
fn env_override_applies() {
    std::env::set_var("TIPOFF_FETCH_TIMEOUT_SECS", "7");
    let config = EngineConfig::from_toml("").unwrap();
    std::env::remove_var("TIPOFF_FETCH_TIMEOUT_SECS");
    assert_eq!(config.fetch.timeout(), Duration::from_secs(7));
}
