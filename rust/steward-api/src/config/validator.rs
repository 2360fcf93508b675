//! Startup validation of configuration combinations.
//!
//! Every check runs; all problems are reported together.

use super::error::{ConfigResult, ConfigurationError};
use super::{AppConfig, StorageBackend, StorageConfig};
use durable_steward::{EngineConfig, WatcherConfig};

/// Configuration validator.
#[derive(Debug)]
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the entire application configuration.
    pub fn validate(config: &AppConfig) -> ConfigResult<()> {
        let mut errors = Vec::new();

        if config.server.timeout_secs == 0 {
            errors.push(ConfigurationError::invalid(
                "server.timeout_secs is 0",
                "Set STEWARD__SERVER__TIMEOUT_SECS to a positive number of seconds",
            ));
        }
        errors.extend(Self::validate_engine(&config.engine));
        errors.extend(Self::validate_watcher(&config.watcher));
        errors.extend(Self::validate_storage(&config.storage));
        errors.extend(Self::validate_actors(config));

        match ConfigurationError::collect(errors) {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    fn validate_engine(engine: &EngineConfig) -> Vec<ConfigurationError> {
        let mut errors = Vec::new();
        if engine.worker_count == 0 {
            errors.push(ConfigurationError::invalid(
                "engine.worker_count is 0",
                "Set STEWARD__ENGINE__WORKER_COUNT to at least 1",
            ));
        }
        if engine.queue_capacity == 0 {
            errors.push(ConfigurationError::invalid(
                "engine.queue_capacity is 0",
                "Set STEWARD__ENGINE__QUEUE_CAPACITY to at least 1",
            ));
        }
        if engine.dispatch_timeout_secs == 0 {
            errors.push(ConfigurationError::invalid(
                "engine.dispatch_timeout_secs is 0",
                "Set STEWARD__ENGINE__DISPATCH_TIMEOUT_SECS to a positive number of seconds",
            ));
        }
        errors
    }

    fn validate_watcher(watcher: &WatcherConfig) -> Vec<ConfigurationError> {
        let mut errors = Vec::new();
        if !watcher.enabled {
            return errors;
        }
        let rate = watcher.failure_rate_threshold;
        if !(rate > 0.0 && rate <= 1.0) {
            errors.push(ConfigurationError::invalid(
                format!("watcher.failure_rate_threshold is {rate}"),
                "Use a ratio in (0, 1], e.g. STEWARD__WATCHER__FAILURE_RATE_THRESHOLD=0.5",
            ));
        }
        if watcher.failure_threshold == 0 {
            errors.push(ConfigurationError::invalid(
                "watcher.failure_threshold is 0",
                "A single failure would trigger a rollback; set STEWARD__WATCHER__FAILURE_THRESHOLD to at least 1",
            ));
        }
        if watcher.window_secs == 0 {
            errors.push(ConfigurationError::invalid(
                "watcher.window_secs is 0",
                "Set STEWARD__WATCHER__WINDOW_SECS to the sampling window in seconds",
            ));
        } else if watcher.poll_interval_secs > watcher.window_secs {
            errors.push(ConfigurationError::incompatible(
                format!("watcher.poll_interval_secs={}", watcher.poll_interval_secs),
                format!("watcher.window_secs={}", watcher.window_secs),
                "Failures could leave the window between two polls; poll at least once per window",
            ));
        }
        errors
    }

    fn validate_storage(storage: &StorageConfig) -> Vec<ConfigurationError> {
        match storage.backend {
            StorageBackend::Memory => Vec::new(),
            StorageBackend::Sqlite if !cfg!(feature = "sqlite-backend") => {
                vec![ConfigurationError::incompatible(
                    "storage.backend=sqlite",
                    "this build",
                    "The binary was built without the 'sqlite-backend' feature",
                )]
            }
            StorageBackend::Sqlite if storage.path.is_none() => {
                vec![ConfigurationError::missing_required(
                    "storage.path",
                    "The sqlite storage backend",
                    "STEWARD__STORAGE__PATH",
                )]
            }
            StorageBackend::Sqlite => Vec::new(),
        }
    }

    fn validate_actors(config: &AppConfig) -> Vec<ConfigurationError> {
        let mut errors = Vec::new();
        if !config.actors.is_empty() && !cfg!(feature = "webhook-actor") {
            errors.push(ConfigurationError::incompatible(
                "actors",
                "this build",
                "Webhook actors need the 'webhook-actor' feature",
            ));
            return errors;
        }

        let mut roles: Vec<&String> = config.actors.keys().collect();
        roles.sort();
        for role in roles {
            let url = &config.actors[role];
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                errors.push(ConfigurationError::invalid(
                    format!("actors.{role} = '{url}' is not an http(s) URL"),
                    format!("Set STEWARD__ACTORS__{} to the webhook endpoint", role.to_uppercase()),
                ));
            }
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlite_requires_path() {
        let mut config = AppConfig::default();
        config.storage.backend = StorageBackend::Sqlite;
        let err = ConfigValidator::validate(&config).unwrap_err();
        assert!(err.to_string().contains("storage.path"));

        config.storage.path = Some("/tmp/steward".into());
        if cfg!(feature = "sqlite-backend") {
            assert!(ConfigValidator::validate(&config).is_ok());
        }
    }

    #[test]
    fn test_all_errors_reported_at_once() {
        let mut config = AppConfig::default();
        config.engine.worker_count = 0;
        config.watcher.failure_rate_threshold = 1.5;
        config.actors.insert("ops".to_string(), "ftp://nowhere".to_string());

        let err = ConfigValidator::validate(&config).unwrap_err();
        assert!(err.count() >= 2);
        let msg = err.to_string();
        assert!(msg.contains("worker_count"));
        assert!(msg.contains("failure_rate_threshold"));
    }

    #[test]
    fn test_disabled_watcher_skips_threshold_checks() {
        let mut config = AppConfig::default();
        config.watcher.enabled = false;
        config.watcher.failure_rate_threshold = 0.0;
        assert!(ConfigValidator::validate(&config).is_ok());
    }

    #[test]
    fn test_poll_slower_than_window_is_incompatible() {
        let mut config = AppConfig::default();
        config.watcher.window_secs = 30;
        config.watcher.poll_interval_secs = 60;
        let err = ConfigValidator::validate(&config).unwrap_err();
        assert!(err.to_string().contains("Incompatible"));
    }
}
