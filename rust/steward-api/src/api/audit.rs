//! Audit log paging.

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use durable_steward::{AuditEntry, StewardError};
use serde::{Deserialize, Serialize};

use crate::error::ApiResult;
use crate::AppState;

const DEFAULT_LIMIT: usize = 100;
const MAX_LIMIT: usize = 1000;

/// Create the audit router.
pub fn router() -> Router<AppState> {
    Router::new().route("/v1/audit", get(read_audit))
}

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    /// First sequence number to return (inclusive).
    #[serde(default = "first_sequence")]
    pub from: u64,
    #[serde(default)]
    pub limit: Option<usize>,
}

fn first_sequence() -> u64 {
    1
}

#[derive(Debug, Serialize)]
pub struct AuditPage {
    pub entries: Vec<AuditEntry>,
    /// Pass as `from` to continue; absent at the end of the log.
    pub next: Option<u64>,
    pub last_sequence: u64,
}

async fn read_audit(
    State(state): State<AppState>,
    Query(query): Query<AuditQuery>,
) -> ApiResult<Json<AuditPage>> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let from = query.from.max(1);

    let entries = state
        .audit
        .read_from(from, limit)
        .await
        .map_err(StewardError::Storage)?;
    let last_sequence = state
        .audit
        .last_sequence()
        .await
        .map_err(StewardError::Storage)?;

    let next = entries
        .last()
        .map(|e| e.sequence_number + 1)
        .filter(|n| *n <= last_sequence);
    Ok(Json(AuditPage {
        entries,
        next,
        last_sequence,
    }))
}
