//! HTTP error responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use durable_steward::{InstanceStatus, StewardError};
use serde::Serialize;
use thiserror::Error;

/// Error returned by every handler.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Steward(#[from] StewardError),

    /// Malformed request that never reached the core.
    #[error("{0}")]
    BadRequest(String),
}

/// JSON error body.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<InstanceStatus>,
}

impl ApiError {
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Steward(err) => match err {
                StewardError::Validation { .. } => StatusCode::BAD_REQUEST,
                StewardError::NotFound { .. } => StatusCode::NOT_FOUND,
                StewardError::ConcurrencyConflict { .. }
                | StewardError::InvalidState { .. }
                | StewardError::CompensationFailure { .. } => StatusCode::CONFLICT,
                StewardError::ExternalActor { .. } | StewardError::Storage(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        }
    }

    fn body(&self) -> ErrorBody {
        match self {
            Self::BadRequest(message) => ErrorBody {
                error: "bad_request",
                message: message.clone(),
                policy_id: None,
                instance_id: None,
                state: None,
            },
            Self::Steward(err) => ErrorBody {
                error: err.code(),
                message: err.to_string(),
                policy_id: err.policy_id().map(str::to_string),
                instance_id: err.instance_id().map(str::to_string),
                state: err.state(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::debug!(error = %self, status = status.as_u16(), "Request rejected");
        }
        (status, Json(self.body())).into_response()
    }
}

/// Handler result type.
pub type ApiResult<T> = Result<T, ApiError>;
