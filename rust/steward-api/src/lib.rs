//! Steward API - HTTP surface of the durable policy steward.
//!
//! Exposes the orchestration core from `durable-steward` over HTTP:
//!
//! - **Policies**: publish versions, inspect history, manual rollback
//! - **Workflows**: start, inspect, abort, report step outcomes
//! - **Tickets**: resolve human approval gates
//! - **Audit**: page through the append-only log and per-instance history
//! - **Events**: live topic subscriptions over SSE
//!
//! # Modules
//!
//! - [`config`]: Configuration loading and validation
//! - [`server`]: Bootstrap of the core and the router
//! - [`api`]: HTTP endpoints
//! - [`error`]: Error to HTTP response mapping
//! - [`logging`]: Startup logging helpers
//!
//! # Example
//!
//! ```rust,ignore
//! use steward_api::{config::AppConfig, server::create_app};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = AppConfig::load(None)?;
//!     let (app, steward) = create_app(config).await?;
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
//!     axum::serve(listener, app).await?;
//!     steward.shutdown().await;
//!     Ok(())
//! }
//! ```


pub mod api;
pub mod config;
pub mod error;
pub mod logging;
pub mod server;

use std::sync::Arc;

use config::AppConfig;
use durable_steward::{AuditLog, EventFanOut, PolicyStore, RollbackWatcher, Steward, WorkflowEngine};
use tokio_util::sync::CancellationToken;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub policies: Arc<PolicyStore>,
    pub engine: WorkflowEngine,
    pub audit: Arc<dyn AuditLog>,
    /// Source of live subscriptions for `/v1/events`.
    pub fanout: EventFanOut,
    pub watcher: Arc<RollbackWatcher>,
    /// Cancelled when the steward shuts down; ends open event streams.
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Handles onto a running steward. The steward itself stays with the
    /// caller, which owns its shutdown.
    #[must_use]
    pub fn from_steward(config: AppConfig, steward: &Steward) -> Self {
        Self {
            config: Arc::new(config),
            policies: Arc::clone(&steward.policies),
            engine: steward.engine.clone(),
            audit: Arc::clone(&steward.audit),
            fanout: steward.fanout.clone(),
            watcher: Arc::clone(&steward.watcher),
            shutdown: steward.shutdown_token(),
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &"AppConfig")
            .field("engine", &self.engine)
            .field("subscribers", &self.fanout.subscriber_count())
            .finish_non_exhaustive()
    }
}
