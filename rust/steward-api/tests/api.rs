//! End-to-end tests of the HTTP surface over the in-memory backends.

use axum::http::StatusCode;
use axum_test::TestServer;
use durable_steward::Steward;
use serde_json::{json, Value};
use steward_api::config::AppConfig;
use steward_api::server::{build_steward, create_router};
use steward_api::AppState;

async fn spawn_app() -> (TestServer, Steward) {
    let mut config = AppConfig::default();
    config.watcher.enabled = false;
    let steward = build_steward(&config).await.unwrap();
    let state = AppState::from_steward(config, &steward);
    let server = TestServer::new(create_router(state)).unwrap();
    (server, steward)
}

fn refund_steps() -> Value {
    json!([
        {"step_id": "draft", "actor_role": "clerk", "sla_duration_ms": 7_200_000},
        {"step_id": "approve", "actor_role": "manager", "sla_duration_ms": 3_600_000,
         "requires_human_approval": true}
    ])
}

async fn publish(server: &TestServer, policy_id: &str) -> u64 {
    let response = server
        .post("/v1/policy")
        .json(&json!({"policy_id": policy_id, "steps": refund_steps()}))
        .await;
    response.assert_status(StatusCode::CREATED);
    response.json::<Value>()["version"].as_u64().unwrap()
}

#[tokio::test]
async fn test_health_reports_engine_counters() {
    let (server, steward) = spawn_app().await;

    let response = server.get("/health").await;
    response.assert_status_ok();
    let body = response.json::<Value>();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["engine"]["started"], 0);
    assert_eq!(body["watcher_enabled"], false);

    server.get("/ready").await.assert_status_ok();
    steward.shutdown().await;
}

#[tokio::test]
async fn test_workflow_runs_through_approval() {
    let (server, steward) = spawn_app().await;
    assert_eq!(publish(&server, "refund").await, 1);

    // camelCase body is accepted too
    let response = server
        .post("/v1/workflow")
        .json(&json!({"policyId": "refund", "context": {"amount": 40}}))
        .await;
    response.assert_status(StatusCode::CREATED);
    let started = response.json::<Value>();
    assert_eq!(started["pinned_version"], 1);
    assert_eq!(started["status"], "RUNNING");
    let instance_id = started["instance_id"].as_str().unwrap().to_string();

    let view = server
        .get(&format!("/v1/workflow/{instance_id}"))
        .await
        .json::<Value>();
    assert_eq!(view["current_step_id"], "draft");
    assert_eq!(view["total_steps"], 2);

    let response = server
        .post(&format!("/v1/workflow/{instance_id}/steps/draft/complete"))
        .json(&json!({"result": {"drafted": true}}))
        .await;
    response.assert_status_ok();
    assert_eq!(response.json::<Value>()["transition"], "applied");

    let view = server
        .get(&format!("/v1/workflow/{instance_id}"))
        .await
        .json::<Value>();
    assert_eq!(view["status"], "PAUSED");
    let ticket_id = view["pending_ticket_id"].as_str().unwrap().to_string();
    assert_eq!(view["pending_ticket"]["step_id"], "approve");

    let response = server
        .post(&format!("/v1/tickets/{ticket_id}/resolve"))
        .json(&json!({"decision": "APPROVED", "decided_by": "dana"}))
        .await;
    response.assert_status_ok();
    assert_eq!(response.json::<Value>()["instance_id"], instance_id.as_str());

    let view = server
        .get(&format!("/v1/workflow/{instance_id}"))
        .await
        .json::<Value>();
    assert_eq!(view["status"], "DONE");
    assert_eq!(view["context"]["steps"]["draft"]["drafted"], true);

    let ticket = server
        .get(&format!("/v1/tickets/{ticket_id}"))
        .await
        .json::<Value>();
    assert_eq!(ticket["status"], "APPROVED");
    assert_eq!(ticket["decided_by"], "dana");

    let history = server
        .get(&format!("/v1/workflow/{instance_id}/history"))
        .await
        .json::<Vec<Value>>();
    assert_eq!(history[0]["event_type"], "INSTANCE_STARTED");
    assert_eq!(
        history.last().unwrap()["event_type"],
        "INSTANCE_COMPLETED"
    );

    steward.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_completion_is_ignored() {
    let (server, steward) = spawn_app().await;
    publish(&server, "refund").await;
    let instance_id = server
        .post("/v1/workflow")
        .json(&json!({"policy_id": "refund"}))
        .await
        .json::<Value>()["instance_id"]
        .as_str()
        .unwrap()
        .to_string();

    let path = format!("/v1/workflow/{instance_id}/steps/draft/complete");
    server.post(&path).json(&json!({})).await.assert_status_ok();
    let second = server.post(&path).json(&json!({})).await;
    second.assert_status_ok();
    assert_eq!(second.json::<Value>()["transition"], "ignored");

    steward.shutdown().await;
}

#[tokio::test]
async fn test_invalid_policy_is_rejected() {
    let (server, steward) = spawn_app().await;

    let response = server
        .post("/v1/policy")
        .json(&json!({"policy_id": "refund", "steps": []}))
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);
    let body = response.json::<Value>();
    assert_eq!(body["error"], "validation_error");
    assert!(body["message"].as_str().unwrap().contains("step list"));

    steward.shutdown().await;
}

#[tokio::test]
async fn test_unknown_ids_are_not_found() {
    let (server, steward) = spawn_app().await;

    let response = server.get("/v1/workflow/missing").await;
    response.assert_status(StatusCode::NOT_FOUND);
    let body = response.json::<Value>();
    assert_eq!(body["error"], "not_found");
    assert_eq!(body["instance_id"], "missing");

    server
        .get("/v1/policy/nope")
        .await
        .assert_status(StatusCode::NOT_FOUND);
    server
        .post("/v1/workflow")
        .json(&json!({"policy_id": "nope"}))
        .await
        .assert_status(StatusCode::NOT_FOUND);
    server
        .post("/v1/tickets/none/resolve")
        .json(&json!({"decision": "APPROVED", "decided_by": "dana"}))
        .await
        .assert_status(StatusCode::NOT_FOUND);

    steward.shutdown().await;
}

#[tokio::test]
async fn test_abort_then_abort_again_conflicts() {
    let (server, steward) = spawn_app().await;
    publish(&server, "refund").await;
    let instance_id = server
        .post("/v1/workflow")
        .json(&json!({"policy_id": "refund"}))
        .await
        .json::<Value>()["instance_id"]
        .as_str()
        .unwrap()
        .to_string();

    // No body at all
    server
        .post(&format!("/v1/workflow/{instance_id}/abort"))
        .await
        .assert_status_ok();
    let view = server
        .get(&format!("/v1/workflow/{instance_id}"))
        .await
        .json::<Value>();
    assert_eq!(view["status"], "ABORTED");

    let response = server
        .post(&format!("/v1/workflow/{instance_id}/abort"))
        .json(&json!({"reason": "again"}))
        .await;
    response.assert_status(StatusCode::CONFLICT);
    let body = response.json::<Value>();
    assert_eq!(body["error"], "invalid_state");
    assert_eq!(body["state"], "ABORTED");

    steward.shutdown().await;
}

#[tokio::test]
async fn test_rollback_and_stale_publish() {
    let (server, steward) = spawn_app().await;
    publish(&server, "refund").await;
    assert_eq!(publish(&server, "refund").await, 2);

    // The head has moved past revision 1
    let response = server
        .post("/v1/policy")
        .json(&json!({"policy_id": "refund", "steps": refund_steps(), "expected_revision": 1}))
        .await;
    response.assert_status(StatusCode::CONFLICT);
    let body = response.json::<Value>();
    assert_eq!(body["error"], "concurrency_conflict");
    assert_eq!(body["policy_id"], "refund");

    let response = server
        .post("/v1/policy/refund/rollback")
        .json(&json!({"toVersion": 1}))
        .await;
    response.assert_status_ok();
    assert_eq!(response.json::<Value>()["current_version"], 1);

    let policy = server.get("/v1/policy/refund").await.json::<Value>();
    assert_eq!(policy["current_version"], 1);
    let statuses: Vec<&str> = policy["versions"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v["status"].as_str().unwrap())
        .collect();
    assert_eq!(statuses, ["ACTIVE", "ROLLED_BACK"]);

    server
        .post("/v1/policy/refund/rollback")
        .json(&json!({"to_version": 9}))
        .await
        .assert_status(StatusCode::NOT_FOUND);

    steward.shutdown().await;
}

#[tokio::test]
async fn test_draft_then_activate() {
    let (server, steward) = spawn_app().await;
    publish(&server, "refund").await;

    let response = server
        .post("/v1/policy/refund/drafts")
        .json(&json!({"steps": refund_steps()}))
        .await;
    response.assert_status(StatusCode::CREATED);
    let draft = response.json::<Value>();
    assert_eq!(draft["version"], 2);
    assert_eq!(draft["status"], "DRAFT");

    let policy = server.get("/v1/policy/refund").await.json::<Value>();
    assert_eq!(policy["current_version"], 1);

    let response = server
        .post("/v1/policy/refund/versions/2/activate")
        .json(&json!({}))
        .await;
    response.assert_status_ok();
    assert_eq!(response.json::<Value>()["current_version"], 2);

    let version = server
        .get("/v1/policy/refund/versions/1")
        .await
        .json::<Value>();
    assert_eq!(version["status"], "SUPERSEDED");

    steward.shutdown().await;
}

#[tokio::test]
async fn test_audit_paging_is_contiguous() {
    let (server, steward) = spawn_app().await;
    publish(&server, "refund").await;
    server
        .post("/v1/workflow")
        .json(&json!({"policy_id": "refund"}))
        .await
        .assert_status(StatusCode::CREATED);

    let first = server
        .get("/v1/audit")
        .add_query_param("from", 1)
        .add_query_param("limit", 2)
        .await
        .json::<Value>();
    let entries = first["entries"].as_array().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["sequence_number"], 1);
    assert_eq!(entries[1]["sequence_number"], 2);
    assert_eq!(first["next"], 3);

    let last = first["last_sequence"].as_u64().unwrap();
    let rest = server
        .get("/v1/audit")
        .add_query_param("from", 3)
        .add_query_param("limit", 1000)
        .await
        .json::<Value>();
    let rest = rest["entries"].as_array().unwrap();
    assert_eq!(rest.len() as u64, last - 2);
    for (i, entry) in rest.iter().enumerate() {
        assert_eq!(entry["sequence_number"], i as u64 + 3);
    }

    steward.shutdown().await;
}

#[tokio::test]
async fn test_bad_topic_pattern_is_rejected() {
    let (server, steward) = spawn_app().await;

    let response = server
        .get("/v1/events")
        .add_query_param("topic", "workflow..started")
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);
    assert_eq!(response.json::<Value>()["error"], "validation_error");

    steward.shutdown().await;
}
