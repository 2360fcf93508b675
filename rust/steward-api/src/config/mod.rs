//! Configuration management for the steward API.
//!
//! Sources, later ones overriding earlier ones:
//! 1. Built-in defaults
//! 2. `config/steward.{toml,yaml,json}` (or the file passed with `--config`)
//! 3. Environment variables prefixed `STEWARD__`, with `__` between
//!    sections (`STEWARD__WATCHER__FAILURE_THRESHOLD=25`)
//!
//! A `.env` file is loaded first if present.
//!
//! # Validation
//!
//! ```rust,ignore
//! use steward_api::config::{AppConfig, ConfigValidator};
//!
//! let config = AppConfig::load(None)?;
//! ConfigValidator::validate(&config)?;
//! ```

pub mod error;
pub mod validator;

pub use error::{ConfigResult, ConfigurationError};
pub use validator::ConfigValidator;

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use durable_steward::{EngineConfig, WatcherConfig};
use serde::{Deserialize, Serialize};

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    /// Workflow engine tuning.
    #[serde(default)]
    pub engine: EngineConfig,
    /// Rollback watcher thresholds.
    #[serde(default)]
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Actor role to webhook URL.
    #[serde(default)]
    pub actors: HashMap<String, String>,
}

impl AppConfig {
    /// Load and validate configuration.
    pub fn load(path: Option<&str>) -> anyhow::Result<Self> {
        let config = Self::load_unchecked(path)?;

        ConfigValidator::validate(&config)
            .map_err(|e| anyhow::anyhow!("Configuration validation failed:\n\n{e}"))?;

        Ok(config)
    }

    /// Load configuration without validation.
    pub fn load_unchecked(path: Option<&str>) -> anyhow::Result<Self> {
        // A missing .env is fine
        dotenvy::dotenv().ok();

        let mut builder = config::Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?
            .set_default("storage.backend", "memory")?;

        builder = match path {
            Some(path) => builder.add_source(config::File::with_name(path).required(true)),
            None => builder.add_source(config::File::with_name("config/steward").required(false)),
        };

        let config = builder
            .add_source(
                config::Environment::with_prefix("STEWARD")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Request timeout in seconds. Does not apply to the event stream.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_timeout() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            timeout_secs: default_timeout(),
        }
    }
}

/// Where policies, instances, tickets and the audit log are kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Process memory; lost on restart.
    #[default]
    Memory,
    /// `SQLite` files under `storage.path`.
    Sqlite,
}

impl fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory => f.write_str("memory"),
            Self::Sqlite => f.write_str("sqlite"),
        }
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    /// Data directory for the `SQLite` backend.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}
