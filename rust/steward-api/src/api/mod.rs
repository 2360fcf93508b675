//! HTTP API endpoints.
//!
//! | Method | Path | Handler |
//! |--------|------|---------|
//! | `GET` | `/health`, `/ready` | [`health`] |
//! | `POST` | `/v1/policy` | publish a version |
//! | `GET` | `/v1/policy/{policy_id}` | head and version history |
//! | `POST` | `/v1/policy/{policy_id}/rollback` | manual rollback |
//! | `POST` | `/v1/workflow` | start an instance |
//! | `GET` | `/v1/workflow/{instance_id}` | instance status |
//! | `POST` | `/v1/workflow/{instance_id}/abort` | abort and unwind |
//! | `POST` | `/v1/tickets/{ticket_id}/resolve` | decide an approval |
//! | `GET` | `/v1/audit` | page through the audit log |
//! | `GET` | `/v1/events` | SSE subscription |

pub mod audit;
pub mod events;
pub mod health;
pub mod policies;
pub mod tickets;
pub mod workflows;

use axum::Router;

use crate::AppState;

/// Create the request/response API router. The event stream is mounted
/// separately since it must not be subject to the request timeout.
pub fn create_router() -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .merge(policies::router())
        .merge(workflows::router())
        .merge(tickets::router())
        .merge(audit::router())
}
