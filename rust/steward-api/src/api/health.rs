//! Health check endpoints.

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use durable_steward::EngineStats;
use serde::Serialize;

use crate::AppState;

/// Create the health router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
}

/// Health check response.
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    engine: EngineStats,
    watcher_enabled: bool,
    subscribers: usize,
    events_published: u64,
    checked_at: DateTime<Utc>,
}

/// Liveness plus engine counters.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        engine: state.engine.stats(),
        watcher_enabled: state.watcher.config().enabled,
        subscribers: state.fanout.subscriber_count(),
        events_published: state.fanout.published_count(),
        checked_at: Utc::now(),
    })
}

/// Readiness check response.
#[derive(Debug, Serialize)]
struct ReadinessResponse {
    status: &'static str,
    audit_sequence: Option<u64>,
}

/// Ready once the audit log answers.
async fn readiness_check(State(state): State<AppState>) -> (StatusCode, Json<ReadinessResponse>) {
    match state.audit.last_sequence().await {
        Ok(sequence) => (
            StatusCode::OK,
            Json(ReadinessResponse {
                status: "ready",
                audit_sequence: Some(sequence),
            }),
        ),
        Err(e) => {
            tracing::warn!(error = %e, "Audit log unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ReadinessResponse {
                    status: "unavailable",
                    audit_sequence: None,
                }),
            )
        }
    }
}
