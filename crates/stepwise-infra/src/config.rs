//! Engine configuration loader for Stepwise.
//!
//! Reads `config.toml` from the data directory (`~/.stepwise/` in production)
//! and deserializes it into [`EngineConfig`]. Falls back to defaults when the
//! file is missing or malformed.

use std::path::{Path, PathBuf};

use stepwise_types::config::EngineConfig;

use crate::sqlite::pool::database_url_in;

/// Load engine configuration from `{data_dir}/config.toml`.
///
/// - Missing file: [`EngineConfig::default()`].
/// - Unreadable or unparsable file: logs a warning, returns the default.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            EngineConfig::default()
        }
    }
}

/// Resolve the data directory.
///
/// Priority:
/// 1. `STEPWISE_DATA_DIR` environment variable
/// 2. `~/.stepwise`
/// 3. `.stepwise` in the current directory
pub fn default_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("STEPWISE_DATA_DIR") {
        return PathBuf::from(dir);
    }
    if let Some(home) = dirs::home_dir() {
        return home.join(".stepwise");
    }
    PathBuf::from(".stepwise")
}

/// The configured database URL, or `sqlite://{data_dir}/stepwise.db`.
pub fn database_url(config: &EngineConfig, data_dir: &Path) -> String {
    config
        .database_url
        .clone()
        .unwrap_or_else(|| database_url_in(data_dir))
}

/// The definitions directory; relative paths resolve against `data_dir`.
/// Defaults to `{data_dir}/processes`.
pub fn definitions_dir(config: &EngineConfig, data_dir: &Path) -> PathBuf {
    match &config.definitions_dir {
        Some(dir) if dir.is_absolute() => dir.clone(),
        Some(dir) => data_dir.join(dir),
        None => data_dir.join("processes"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn load_engine_config_missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_engine_config(tmp.path()).await;
        assert!(config.database_url.is_none());
        assert_eq!(config.worker.max_attempts, 3);
        assert_eq!(config.logging.filter, "info");
    }

    #[tokio::test]
    async fn load_engine_config_valid_toml_returns_parsed() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join("config.toml"),
            r#"
database_url = "sqlite:///tmp/custom.db"
definitions_dir = "defs"

[worker]
concurrency = 8
max_attempts = 1

[logging]
filter = "stepwise=debug"
json = true
"#,
        )
        .await
        .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.database_url.as_deref(), Some("sqlite:///tmp/custom.db"));
        assert_eq!(config.worker.concurrency, 8);
        assert_eq!(config.worker.max_attempts, 1);
        assert_eq!(config.worker.backoff_ms, 500);
        assert_eq!(config.logging.filter, "stepwise=debug");
        assert!(config.logging.json);
        assert_eq!(definitions_dir(&config, tmp.path()), tmp.path().join("defs"));
    }

    #[tokio::test]
    async fn load_engine_config_invalid_toml_returns_default() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join("config.toml"), "this is not { valid toml !!!")
            .await
            .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert!(config.database_url.is_none());
        assert_eq!(config.worker.concurrency, 4);
    }

    #[test]
    fn database_url_defaults_to_data_dir() {
        let config = EngineConfig::default();
        let url = database_url(&config, Path::new("/data"));
        assert_eq!(url, "sqlite:///data/stepwise.db");
        assert_eq!(definitions_dir(&config, Path::new("/data")), PathBuf::from("/data/processes"));
    }

    #[test]
    fn default_data_dir_is_not_empty() {
        assert!(!default_data_dir().as_os_str().is_empty());
    }
}
