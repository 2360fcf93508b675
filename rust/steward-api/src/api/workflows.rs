//! Workflow instance endpoints.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use durable_steward::{AuditEntry, InstanceStatus, InstanceView, Transition, Version};
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ApiResult};
use crate::AppState;

/// Create the workflows router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/workflow", post(start_workflow))
        .route("/v1/workflow/{instance_id}", get(get_workflow))
        .route("/v1/workflow/{instance_id}/abort", post(abort_workflow))
        .route("/v1/workflow/{instance_id}/history", get(workflow_history))
        .route(
            "/v1/workflow/{instance_id}/steps/{step_id}/complete",
            post(complete_step),
        )
        .route(
            "/v1/workflow/{instance_id}/steps/{step_id}/fail",
            post(fail_step),
        )
}

/// Body of `POST /v1/workflow`.
#[derive(Debug, Deserialize)]
pub struct StartRequest {
    #[serde(alias = "policyId")]
    pub policy_id: String,
    #[serde(default)]
    pub context: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct StartResponse {
    pub instance_id: String,
    pub policy_id: String,
    pub pinned_version: Version,
    pub status: InstanceStatus,
}

#[derive(Debug, Default, Deserialize)]
pub struct AbortRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CompleteRequest {
    #[serde(default)]
    pub result: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct FailRequest {
    pub reason: String,
}

/// Outcome of a signal sent to an instance.
#[derive(Debug, Serialize)]
pub struct TransitionResponse {
    pub instance_id: String,
    #[serde(flatten)]
    pub transition: Transition,
}

async fn start_workflow(
    State(state): State<AppState>,
    Json(request): Json<StartRequest>,
) -> ApiResult<(StatusCode, Json<StartResponse>)> {
    let instance = state
        .engine
        .start_workflow(&request.policy_id, request.context)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(StartResponse {
            pinned_version: instance.pinned_version(),
            instance_id: instance.instance_id,
            policy_id: instance.policy_id,
            status: instance.status,
        }),
    ))
}

async fn get_workflow(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
) -> ApiResult<Json<InstanceView>> {
    Ok(Json(state.engine.instance(&instance_id).await?))
}

/// The body is optional: `POST .../abort` with no payload is a plain abort.
async fn abort_workflow(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
    body: Bytes,
) -> ApiResult<Json<TransitionResponse>> {
    let request: AbortRequest = if body.iter().all(u8::is_ascii_whitespace) {
        AbortRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::BadRequest(format!("Invalid abort body: {e}")))?
    };
    let transition = state.engine.abort(&instance_id, request.reason).await?;
    Ok(Json(TransitionResponse {
        instance_id,
        transition,
    }))
}

async fn workflow_history(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
) -> ApiResult<Json<Vec<AuditEntry>>> {
    Ok(Json(state.engine.history(&instance_id).await?))
}

async fn complete_step(
    State(state): State<AppState>,
    Path((instance_id, step_id)): Path<(String, String)>,
    Json(request): Json<CompleteRequest>,
) -> ApiResult<Json<TransitionResponse>> {
    let transition = state
        .engine
        .complete_step(&instance_id, &step_id, request.result)
        .await?;
    Ok(Json(TransitionResponse {
        instance_id,
        transition,
    }))
}

async fn fail_step(
    State(state): State<AppState>,
    Path((instance_id, step_id)): Path<(String, String)>,
    Json(request): Json<FailRequest>,
) -> ApiResult<Json<TransitionResponse>> {
    let transition = state
        .engine
        .fail_step(&instance_id, &step_id, request.reason)
        .await?;
    Ok(Json(TransitionResponse {
        instance_id,
        transition,
    }))
}
