//! Policy endpoints: publish, draft, activate, inspect and roll back.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use durable_steward::{PolicyDefinition, PolicyHead, StepSpec, Version};
use serde::{Deserialize, Serialize};

use crate::error::ApiResult;
use crate::AppState;

/// Create the policies router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/policy", post(publish_policy).get(list_policies))
        .route("/v1/policy/{policy_id}", get(get_policy))
        .route("/v1/policy/{policy_id}/drafts", post(draft_policy))
        .route(
            "/v1/policy/{policy_id}/versions/{version}",
            get(get_version),
        )
        .route(
            "/v1/policy/{policy_id}/versions/{version}/activate",
            post(activate_version),
        )
        .route("/v1/policy/{policy_id}/rollback", post(rollback_policy))
}

/// Body of `POST /v1/policy`.
#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    #[serde(alias = "policyId")]
    pub policy_id: String,
    pub steps: Vec<StepSpec>,
    #[serde(default, alias = "rollbackTarget")]
    pub rollback_target: Option<Version>,
    /// Fail with 409 unless the head is still at this revision.
    #[serde(default, alias = "expectedRevision")]
    pub expected_revision: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct PublishResponse {
    pub policy_id: String,
    pub version: Version,
}

/// Body of `POST /v1/policy/{policy_id}/drafts`.
#[derive(Debug, Deserialize)]
pub struct DraftRequest {
    pub steps: Vec<StepSpec>,
    #[serde(default, alias = "rollbackTarget")]
    pub rollback_target: Option<Version>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ActivateRequest {
    #[serde(default, alias = "expectedRevision")]
    pub expected_revision: Option<u64>,
}

/// Body of `POST /v1/policy/{policy_id}/rollback`.
#[derive(Debug, Deserialize)]
pub struct RollbackRequest {
    #[serde(alias = "toVersion")]
    pub to_version: Version,
}

/// A policy's head plus every version.
#[derive(Debug, Serialize)]
pub struct PolicyResponse {
    pub policy_id: String,
    pub current_version: Option<Version>,
    pub revision: u64,
    pub versions: Vec<PolicyDefinition>,
}

async fn publish_policy(
    State(state): State<AppState>,
    Json(request): Json<PublishRequest>,
) -> ApiResult<(StatusCode, Json<PublishResponse>)> {
    let version = state
        .policies
        .publish_expecting(
            &request.policy_id,
            request.steps,
            request.rollback_target,
            request.expected_revision,
        )
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(PublishResponse {
            policy_id: request.policy_id,
            version,
        }),
    ))
}

async fn list_policies(State(state): State<AppState>) -> ApiResult<Json<Vec<String>>> {
    Ok(Json(state.policies.list().await?))
}

async fn get_policy(
    State(state): State<AppState>,
    Path(policy_id): Path<String>,
) -> ApiResult<Json<PolicyResponse>> {
    let versions = state.policies.versions(&policy_id).await?;
    let head = state.policies.head(&policy_id).await?;
    Ok(Json(PolicyResponse {
        current_version: head.as_ref().map(|h| h.current_version),
        revision: head.map_or(0, |h| h.revision),
        policy_id,
        versions,
    }))
}

async fn get_version(
    State(state): State<AppState>,
    Path((policy_id, version)): Path<(String, Version)>,
) -> ApiResult<Json<PolicyDefinition>> {
    Ok(Json(state.policies.get(&policy_id, version).await?))
}

async fn draft_policy(
    State(state): State<AppState>,
    Path(policy_id): Path<String>,
    Json(request): Json<DraftRequest>,
) -> ApiResult<(StatusCode, Json<PolicyDefinition>)> {
    let definition = state
        .policies
        .draft(&policy_id, request.steps, request.rollback_target)
        .await?;
    Ok((StatusCode::CREATED, Json(definition)))
}

async fn activate_version(
    State(state): State<AppState>,
    Path((policy_id, version)): Path<(String, Version)>,
    Json(request): Json<ActivateRequest>,
) -> ApiResult<Json<PolicyHead>> {
    let head = state
        .policies
        .activate(&policy_id, version, request.expected_revision)
        .await?;
    Ok(Json(head))
}

async fn rollback_policy(
    State(state): State<AppState>,
    Path(policy_id): Path<String>,
    Json(request): Json<RollbackRequest>,
) -> ApiResult<Json<PolicyHead>> {
    let head = state.policies.rollback(&policy_id, request.to_version).await?;
    Ok(Json(head))
}
