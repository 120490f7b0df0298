//! Tracing subscriber initialization.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default filter directive when `BLAZE_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "blaze_cache=info,warn";

/// Subscriber configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracingConfig {
    /// `EnvFilter` directive, e.g. `blaze_cache=debug,info`.
    pub filter: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_string(),
            json: false,
        }
    }
}

impl TracingConfig {
    /// Read configuration from the environment.
    ///
    /// # Environment Variables
    /// - `BLAZE_LOG`: filter directive (default: `blaze_cache=info,warn`)
    /// - `BLAZE_LOG_JSON`: `true` or `1` for JSON output (default: false)
    pub fn from_env() -> Self {
        Self {
            filter: std::env::var("BLAZE_LOG").unwrap_or_else(|_| DEFAULT_LOG_FILTER.to_string()),
            json: std::env::var("BLAZE_LOG_JSON")
                .map(|s| s == "true" || s == "1")
                .unwrap_or(false),
        }
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = filter.into();
        self
    }

    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }
}

/// Tracing setup failures.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum TelemetryError {
    #[error("Invalid log filter {filter:?}: {reason}")]
    InvalidFilter { filter: String, reason: String },

    #[error("Failed to init subscriber: {0}")]
    AlreadyInitialized(String),
}

/// Install the global tracing subscriber.
///
/// Fails with [`TelemetryError::AlreadyInitialized`] when a subscriber is
/// already installed, so callers may treat a second call as harmless.
pub fn init_tracing(config: &TracingConfig) -> Result<(), TelemetryError> {
    let env_filter =
        EnvFilter::try_new(&config.filter).map_err(|e| TelemetryError::InvalidFilter {
            filter: config.filter.clone(),
            reason: e.to_string(),
        })?;

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if config.json {
        registry.with(tracing_subscriber::fmt::layer().json()).try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().compact())
            .try_init()
    };
    result.map_err(|e| TelemetryError::AlreadyInitialized(e.to_string()))?;

    tracing::info!(filter = %config.filter, json = config.json, "Tracing initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TracingConfig::default();
        assert_eq!(config.filter, DEFAULT_LOG_FILTER);
        assert!(!config.json);
    }

    #[test]
    fn test_invalid_filter_is_rejected() {
        let config = TracingConfig::default().with_filter("blaze_cache=notalevel");
        assert!(matches!(
            init_tracing(&config),
            Err(TelemetryError::InvalidFilter { .. })
        ));
    }

    #[test]
    fn test_second_init_reports_already_initialized() {
        let config = TracingConfig::default().with_json(true);
        let first = init_tracing(&config);
        let second = init_tracing(&config);
        // Another test may have installed a subscriber first.
        assert!(first.is_ok() || matches!(first, Err(TelemetryError::AlreadyInitialized(_))));
        assert!(matches!(second, Err(TelemetryError::AlreadyInitialized(_))));
    }
}
