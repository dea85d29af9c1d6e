//! Tracing subscriber initialization with structured logging.
//!
//! # Usage
//!
//! ```no_run
//! use stepwise_types::config::LoggingConfig;
//!
//! // Human-readable output at the configured level
//! stepwise_observe::init_tracing(&LoggingConfig::default()).unwrap();
//! ```

use stepwise_types::config::LoggingConfig;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Initialize the global tracing subscriber.
///
/// - Installs a `fmt` layer with target visibility and span close timing,
///   emitting JSON lines when `config.json` is set.
/// - Filters with `RUST_LOG` when it is set and non-empty, otherwise with
///   `config.filter`.
///
/// # Errors
///
/// Returns an error if the filter directive is invalid or a global
/// subscriber has already been set.
pub fn init_tracing(config: &LoggingConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let env_filter = resolve_filter(rust_log.as_deref(), config)?;
    let registry = tracing_subscriber::registry().with(env_filter);

    if config.json {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_events(FmtSpan::CLOSE);
        registry.with(fmt_layer).try_init()?;
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_span_events(FmtSpan::CLOSE);
        registry.with(fmt_layer).try_init()?;
    }

    Ok(())
}

/// Install a test-writer subscriber filtered by `RUST_LOG`.
///
/// Silently does nothing if a subscriber is already installed, so every test
/// may call it.
pub fn try_init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn resolve_filter(rust_log: Option<&str>, config: &LoggingConfig) -> Result<EnvFilter, ParseError> {
    match rust_log {
        Some(directives) if !directives.trim().is_empty() => EnvFilter::try_new(directives),
        _ => EnvFilter::try_new(&config.filter),
    }
}
