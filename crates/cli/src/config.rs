use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use tipoff_core::EngineConfig;

/// Config file looked up in the working directory when `--config` is absent.
const LOCAL_CONFIG: &str = "tipoff.toml";

/// Return the default config file path: ~/.config/tipoff/config.toml
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("tipoff").join("config.toml"))
}

/// Load the engine config.
///
/// An explicit path must exist. Otherwise `./tipoff.toml` and then the user
/// config file are tried, falling back to defaults plus `TIPOFF_*` overrides.
pub fn load(path: Option<&Path>, data_dir: Option<PathBuf>) -> Result<EngineConfig> {
    let candidate = match path {
        Some(p) => Some(p.to_path_buf()),
        None => [Some(PathBuf::from(LOCAL_CONFIG)), default_config_path()]
            .into_iter()
            .flatten()
            .find(|p| p.exists()),
    };

    let mut config = match candidate {
        Some(config_path) => {
            debug!(?config_path, "loading config");
            EngineConfig::from_file(&config_path)
                .with_context(|| format!("failed to load config: {}", config_path.display()))?
        }
        None => {
            debug!("no config file found, using defaults and environment");
            EngineConfig::from_env().context("invalid configuration from environment")?
        }
    };

    if let Some(dir) = data_dir {
        config.storage.data_dir = Some(dir);
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_path_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.toml");
        std::fs::write(
            &path,
            r#"
[[sources]]
id = "scoreboard-today"
source_type = "scoreboard"
path = "scoreboard"
"#,
        )
        .unwrap();

        let config = load(Some(&path), Some(dir.path().join("data"))).unwrap();
        assert_eq!(config.sources.len(), 1);
        assert_eq!(config.storage.data_dir, Some(dir.path().join("data")));
    }

    #[test]
    fn missing_explicit_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load(Some(&dir.path().join("absent.toml")), None).unwrap_err();
        assert!(err.to_string().contains("absent.toml"));
    }
}
