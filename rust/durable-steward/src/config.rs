//! Runtime tuning for the engine and the rollback watcher.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Workflow engine settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Workers draining the instance event queue.
    pub worker_count: usize,
    /// Bound of the instance event queue.
    pub queue_capacity: usize,
    /// Upper bound on a single actor dispatch call. A call that exceeds it
    /// leaves the step pending, as if the actor had deferred.
    pub dispatch_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            queue_capacity: 1024,
            dispatch_timeout_secs: 30,
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch_timeout_secs)
    }
}

/// Rollback watcher settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    pub enabled: bool,
    /// Sliding window the failure rate is computed over.
    pub window_secs: u64,
    pub poll_interval_secs: u64,
    /// Minimum failed instances in the window before a rollback is considered.
    pub failure_threshold: usize,
    /// Failed / attempted instances ratio that must also be exceeded.
    pub failure_rate_threshold: f64,
    /// Auto-rollback is suspended this long after any rollback of the policy.
    pub cooldown_secs: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_secs: 300,
            poll_interval_secs: 10,
            failure_threshold: 50,
            failure_rate_threshold: 0.5,
            cooldown_secs: 900,
        }
    }
}

impl WatcherConfig {
    #[must_use]
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    #[must_use]
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: WatcherConfig =
            serde_json::from_value(serde_json::json!({"failure_threshold": 10})).unwrap();
        assert_eq!(config.failure_threshold, 10);
        assert_eq!(config.window(), Duration::from_secs(300));
        assert!(config.enabled);
    }

    #[test]
    fn test_poll_interval_never_zero() {
        let config = WatcherConfig {
            poll_interval_secs: 0,
            ..WatcherConfig::default()
        };
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
    }
}
