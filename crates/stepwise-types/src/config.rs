//! Engine configuration types for Stepwise.
//!
//! `EngineConfig` represents the top-level `config.toml` that controls the
//! database location, where process definitions are loaded from, the machine
//! worker, and logging.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level configuration for the Stepwise engine.
///
/// Loaded from `~/.stepwise/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// SQLite URL; defaults to `sqlite://{data_dir}/stepwise.db` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,

    /// Directory scanned for `*.toml` process definitions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definitions_dir: Option<PathBuf>,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Machine-node worker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Maximum handlers running at once.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Handler invocations per task before it is marked failed (1 = no retry).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base delay between attempts; attempt `n` waits `n * backoff_ms`.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_concurrency() -> usize {
    4
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    500
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

/// Logging settings consumed by `stepwise-observe`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is not set.
    #[serde(default = "default_filter")]
    pub filter: String,

    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

fn default_filter() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default_values() {
        let config = EngineConfig::default();
        assert!(config.database_url.is_none());
        assert!(config.definitions_dir.is_none());
        assert_eq!(config.worker.concurrency, 4);
        assert_eq!(config.worker.max_attempts, 3);
        assert_eq!(config.worker.backoff_ms, 500);
        assert_eq!(config.logging.filter, "info");
        assert!(!config.logging.json);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: EngineConfig = toml::from_str(
            r#"
database_url = "sqlite://tmp/test.db"

[worker]
max_attempts = 1
"#,
        )
        .unwrap();
        assert_eq!(config.database_url.as_deref(), Some("sqlite://tmp/test.db"));
        assert_eq!(config.worker.max_attempts, 1);
        assert_eq!(config.worker.concurrency, 4);
        assert_eq!(config.logging.filter, "info");
    }
}
