//! HTTP server setup and middleware.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use durable_steward::{AuditLog, StateStore, Steward};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::api;
use crate::config::{AppConfig, StorageBackend};
use crate::logging::OpTimer;
use crate::{log_banner, log_init_step, log_init_warning, log_success, AppState};

/// Steward API version (from Cargo.toml).
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Boot the orchestration core and build the router on top of it.
///
/// The returned [`Steward`] owns the background tasks; shut it down after
/// the server stops.
pub async fn create_app(config: AppConfig) -> anyhow::Result<(Router, Steward)> {
    let overall_timer = OpTimer::new("server", "create_app");

    log_banner!(
        format!("Steward API v{VERSION}"),
        format!("Storage: {}", config.storage.backend)
    );

    let steward = build_steward(&config).await?;

    let step_timer = OpTimer::new("server", "router");
    let state = AppState::from_steward(config, &steward);
    let app = create_router(state);
    log_init_step!(4, 4, "Router", "Routes + middleware configured");
    step_timer.finish();

    overall_timer.finish();
    log_success!("Steward API server created successfully");

    Ok((app, steward))
}

/// Build the router with middleware for an existing state.
pub fn create_router(state: AppState) -> Router {
    let timeout = Duration::from_secs(state.config.server.timeout_secs);

    // The event stream is long-lived and must not hit the request timeout
    let timed = api::create_router().layer(TimeoutLayer::with_status_code(
        axum::http::StatusCode::REQUEST_TIMEOUT,
        timeout,
    ));

    Router::new()
        .merge(timed)
        .merge(api::events::router())
        .layer(
            ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            ),
        )
        .with_state(state)
}

/// Open storage, register actors and start the core.
pub async fn build_steward(config: &AppConfig) -> anyhow::Result<Steward> {
    // [1/4] Storage
    let step_timer = OpTimer::new("server", "storage");
    let (audit, state) = open_storage(config).await?;
    log_init_step!(
        1,
        4,
        "Storage",
        match &config.storage.path {
            Some(path) => format!("{} at {}", config.storage.backend, path.display()),
            None => config.storage.backend.to_string(),
        }
    );
    step_timer.finish();

    // [2/4] Actors
    let step_timer = OpTimer::new("server", "actors");
    let mut builder = Steward::builder()
        .with_engine_config(config.engine.clone())
        .with_watcher_config(config.watcher.clone());
    if let Some(audit) = audit {
        builder = builder.with_audit_log(audit);
    }
    if let Some(state) = state {
        builder = builder.with_state_store(state);
    }
    builder = register_actors(builder, config)?;
    log_init_step!(
        2,
        4,
        "Actors",
        if config.actors.is_empty() {
            "none registered, every step is deferred".to_string()
        } else {
            format!("{} webhook role(s)", config.actors.len())
        }
    );
    step_timer.finish();

    // [3/4] Core
    let step_timer = OpTimer::new("server", "steward");
    let steward = builder.start().await;
    step_timer.finish_with_result(steward.as_ref());
    let steward = steward.context("Failed to start steward")?;
    if !config.watcher.enabled {
        log_init_warning!("Rollback watcher disabled; policies are only rolled back manually");
    }
    log_init_step!(
        3,
        4,
        "Steward",
        format!(
            "{} worker(s), {} timer(s) armed",
            config.engine.worker_count,
            steward.timers.pending()
        )
    );

    Ok(steward)
}

type Storage = (Option<Arc<dyn AuditLog>>, Option<Arc<dyn StateStore>>);

async fn open_storage(config: &AppConfig) -> anyhow::Result<Storage> {
    match config.storage.backend {
        StorageBackend::Memory => Ok((None, None)),
        StorageBackend::Sqlite => open_sqlite(config).await,
    }
}

#[cfg(feature = "sqlite-backend")]
async fn open_sqlite(config: &AppConfig) -> anyhow::Result<Storage> {
    use durable_steward::audit::SqliteAuditLog;
    use durable_steward::storage::SqliteStateStore;

    let dir = config
        .storage
        .path
        .clone()
        .context("storage.path is required for the sqlite backend")?;
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create data directory {}", dir.display()))?;

    let audit = SqliteAuditLog::open(dir.join("audit.db")).await?;
    let state = SqliteStateStore::open(dir.join("state.db")).await?;
    Ok((
        Some(Arc::new(audit) as Arc<dyn AuditLog>),
        Some(Arc::new(state) as Arc<dyn StateStore>),
    ))
}

#[cfg(not(feature = "sqlite-backend"))]
async fn open_sqlite(_config: &AppConfig) -> anyhow::Result<Storage> {
    anyhow::bail!("storage.backend=sqlite requires the 'sqlite-backend' feature")
}

#[cfg(feature = "webhook-actor")]
fn register_actors(
    mut builder: durable_steward::StewardBuilder,
    config: &AppConfig,
) -> anyhow::Result<durable_steward::StewardBuilder> {
    use durable_steward::actors::WebhookActor;

    for (role, url) in &config.actors {
        let actor = WebhookActor::with_timeout(url, config.engine.dispatch_timeout())
            .with_context(|| format!("Invalid webhook for actor role '{role}'"))?;
        tracing::info!(role = %role, url = %url, "Registered webhook actor");
        builder = builder.with_actor(role.clone(), Arc::new(actor));
    }
    Ok(builder)
}

#[cfg(not(feature = "webhook-actor"))]
fn register_actors(
    builder: durable_steward::StewardBuilder,
    config: &AppConfig,
) -> anyhow::Result<durable_steward::StewardBuilder> {
    if !config.actors.is_empty() {
        anyhow::bail!("actors are configured but the 'webhook-actor' feature is disabled");
    }
    Ok(builder)
}
