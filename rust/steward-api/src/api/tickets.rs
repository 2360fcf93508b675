//! Human decision endpoints.

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use durable_steward::{Ticket, TicketResolution};

use super::workflows::TransitionResponse;
use crate::error::ApiResult;
use crate::AppState;

/// Create the tickets router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/tickets/{ticket_id}", get(get_ticket))
        .route("/v1/tickets/{ticket_id}/resolve", post(resolve_ticket))
}

async fn get_ticket(
    State(state): State<AppState>,
    Path(ticket_id): Path<String>,
) -> ApiResult<Json<Ticket>> {
    Ok(Json(state.engine.ticket(&ticket_id).await?))
}

/// Body: `{"decision": "APPROVED" | "REJECTED" | "EDITED", "decided_by", "note"?, "edits"?}`.
async fn resolve_ticket(
    State(state): State<AppState>,
    Path(ticket_id): Path<String>,
    Json(resolution): Json<TicketResolution>,
) -> ApiResult<Json<TransitionResponse>> {
    let ticket = state.engine.ticket(&ticket_id).await?;
    let transition = state.engine.resolve_ticket(&ticket_id, resolution).await?;
    Ok(Json(TransitionResponse {
        instance_id: ticket.instance_id,
        transition,
    }))
}
