//! End-to-end workflow scenarios against the in-memory runtime.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use durable_steward::prelude::*;
use durable_steward::{
    AuditEntry, EngineConfig, StewardBuilder, TicketSurface, TopicPattern, WatcherConfig,
};
use parking_lot::Mutex;

const HOUR: Duration = Duration::from_secs(3600);

fn builder() -> StewardBuilder {
    Steward::builder().with_watcher_config(WatcherConfig {
        enabled: false,
        ..WatcherConfig::default()
    })
}

fn review_policy() -> Vec<StepSpec> {
    vec![
        StepSpec::new("draft", "clerk", 2 * HOUR),
        StepSpec::new("review", "supervisor", 4 * HOUR).requiring_approval(),
        StepSpec::new("deploy", "ops", 6 * HOUR),
    ]
}

fn count(history: &[AuditEntry], event_type: AuditEventType) -> usize {
    history.iter().filter(|e| e.event_type == event_type).count()
}

async fn wait_for_terminal(steward: &Steward, instance_id: &str) -> InstanceStatus {
    for _ in 0..500 {
        let view = steward.engine.instance(instance_id).await.unwrap();
        if view.instance.status.is_terminal() {
            return view.instance.status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("instance {instance_id} never reached a terminal state");
}

/// Actor that records dispatches and compensations, failing chosen steps.
#[derive(Default)]
struct ScriptedActor {
    fail_steps: Vec<String>,
    fail_compensation: Vec<String>,
    compensated: Mutex<Vec<String>>,
}

impl ScriptedActor {
    fn failing(steps: &[&str]) -> Self {
        Self {
            fail_steps: steps.iter().map(ToString::to_string).collect(),
            ..Self::default()
        }
    }
}

#[async_trait]
impl Actor for ScriptedActor {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn dispatch(&self, request: &ActorRequest) -> ActorOutcome {
        if self.fail_steps.contains(&request.step_id) {
            ActorOutcome::failure(format!("{} exploded", request.step_id))
        } else {
            ActorOutcome::success(serde_json::json!({ "done": request.step_id }))
        }
    }

    async fn compensate(
        &self,
        request: &ActorRequest,
        _compensation: &serde_json::Value,
    ) -> anyhow::Result<serde_json::Value> {
        if self.fail_compensation.contains(&request.step_id) {
            anyhow::bail!("cannot undo {}", request.step_id);
        }
        self.compensated.lock().push(request.step_id.clone());
        Ok(serde_json::json!({ "undone": request.step_id }))
    }
}

#[tokio::test]
async fn test_approval_gate_pauses_and_resumes_to_done() {
    let steward = builder().start().await.unwrap();
    steward.policies.publish("P", review_policy(), None).await.unwrap();

    let instance = steward
        .engine
        .start_workflow("P", serde_json::json!({"ticket": 7}))
        .await
        .unwrap();
    assert_eq!(instance.pinned_version(), 1);
    let id = instance.instance_id.clone();

    let t = steward
        .engine
        .complete_step(&id, "draft", serde_json::json!({"doc": "v1"}))
        .await
        .unwrap();
    assert!(t.is_applied());

    let view = steward.engine.instance(&id).await.unwrap();
    assert_eq!(view.instance.status, InstanceStatus::Paused);
    assert_eq!(view.current_step_id.as_deref(), Some("review"));
    let ticket = view.pending_ticket.expect("ticket created");
    assert_eq!(ticket.status, TicketStatus::Pending);

    let t = steward
        .engine
        .resolve_ticket(&ticket.ticket_id, TicketResolution::approve("alice"))
        .await
        .unwrap();
    assert_eq!(t, Transition::Applied { status: InstanceStatus::Running });

    steward
        .engine
        .complete_step(&id, "deploy", serde_json::Value::Null)
        .await
        .unwrap();

    let view = steward.engine.instance(&id).await.unwrap();
    assert_eq!(view.instance.status, InstanceStatus::Done);
    assert_eq!(view.instance.context["steps"]["draft"]["doc"], "v1");

    let history = steward.engine.history(&id).await.unwrap();
    assert_eq!(count(&history, AuditEventType::StepCompleted), 3);
    assert_eq!(count(&history, AuditEventType::InstanceCompleted), 1);
    let decided = steward.engine.ticket(&ticket.ticket_id).await.unwrap();
    assert_eq!(decided.decided_by.as_deref(), Some("alice"));

    steward.shutdown().await;
}

#[tokio::test]
async fn test_edited_ticket_merges_context() {
    let steward = builder().start().await.unwrap();
    steward.policies.publish("P", review_policy(), None).await.unwrap();
    let id = steward
        .engine
        .start_workflow("P", serde_json::json!({"amount": 40}))
        .await
        .unwrap()
        .instance_id;
    steward
        .engine
        .complete_step(&id, "draft", serde_json::Value::Null)
        .await
        .unwrap();

    let ticket_id = steward.engine.instance(&id).await.unwrap().instance.pending_ticket_id.unwrap();
    steward
        .engine
        .resolve_ticket(
            &ticket_id,
            TicketResolution::edit("bob", serde_json::json!({"amount": 35})),
        )
        .await
        .unwrap();

    let view = steward.engine.instance(&id).await.unwrap();
    assert_eq!(view.instance.context["amount"], 35);
    assert_eq!(view.current_step_id.as_deref(), Some("deploy"));

    // A second decision on the same ticket is stale
    let again = steward
        .engine
        .resolve_ticket(&ticket_id, TicketResolution::approve("carol"))
        .await
        .unwrap();
    assert!(!again.is_applied());
    steward.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_sla_expiry_escalates_without_failing() {
    let steward = builder().start().await.unwrap();
    steward.policies.publish("P", review_policy(), None).await.unwrap();
    let mut missed = steward
        .fanout
        .subscribe(TopicPattern::new("workflow.sla_missed").unwrap());

    let id = steward
        .engine
        .start_workflow("P", serde_json::Value::Null)
        .await
        .unwrap()
        .instance_id;
    steward
        .engine
        .complete_step(&id, "draft", serde_json::Value::Null)
        .await
        .unwrap();

    tokio::time::advance(4 * HOUR + Duration::from_secs(1)).await;
    let envelope = missed.recv().await.unwrap();
    assert_eq!(envelope.payload["data"]["step_id"], "review");
    assert_eq!(envelope.payload["data"]["hop"], 0);
    assert_eq!(envelope.correlation_id.as_deref(), Some(id.as_str()));

    let view = steward.engine.instance(&id).await.unwrap();
    assert_eq!(view.instance.status, InstanceStatus::Paused);
    assert_eq!(view.instance.escalation_level, 1);

    let history = steward.engine.history(&id).await.unwrap();
    assert_eq!(count(&history, AuditEventType::SlaMissed), 1);
    assert!(missed.try_recv().is_none());
    steward.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_escalation_chain_walks_every_hop() {
    let steward = builder().start().await.unwrap();
    steward
        .policies
        .publish(
            "chain",
            vec![StepSpec::new("approve", "manager", HOUR)
                .with_escalation(EscalationHop::new("team-lead", Duration::ZERO))
                .with_escalation(EscalationHop::new("director", 2 * HOUR))],
            None,
        )
        .await
        .unwrap();
    let mut missed = steward
        .fanout
        .subscribe(TopicPattern::new("workflow.sla_missed").unwrap());
    steward
        .engine
        .start_workflow("chain", serde_json::Value::Null)
        .await
        .unwrap();

    tokio::time::advance(HOUR + Duration::from_secs(1)).await;
    let first = missed.recv().await.unwrap();
    assert_eq!(first.payload["data"]["contact"], "team-lead");
    assert_eq!(first.payload["data"]["more_hops"], true);

    tokio::time::advance(2 * HOUR).await;
    let second = missed.recv().await.unwrap();
    assert_eq!(second.payload["data"]["contact"], "director");
    assert_eq!(second.payload["data"]["more_hops"], false);

    // Chain exhausted: nothing else is armed
    assert_eq!(steward.timers.pending(), 0);
    steward.shutdown().await;
}

#[tokio::test]
async fn test_failure_compensates_in_reverse_order() {
    let actor = Arc::new(ScriptedActor::failing(&["C"]));
    let steward = builder()
        .with_actor("worker", Arc::clone(&actor) as Arc<dyn Actor>)
        .start()
        .await
        .unwrap();
    steward
        .policies
        .publish(
            "saga",
            vec![
                StepSpec::new("A", "worker", HOUR).with_compensation(serde_json::json!("undo-a")),
                StepSpec::new("B", "worker", HOUR).with_compensation(serde_json::json!("undo-b")),
                StepSpec::new("C", "worker", HOUR),
            ],
            None,
        )
        .await
        .unwrap();

    let id = steward
        .engine
        .start_workflow("saga", serde_json::Value::Null)
        .await
        .unwrap()
        .instance_id;
    assert_eq!(wait_for_terminal(&steward, &id).await, InstanceStatus::Aborted);
    assert_eq!(*actor.compensated.lock(), vec!["B".to_string(), "A".to_string()]);

    let history = steward.engine.history(&id).await.unwrap();
    let compensated: Vec<&str> = history
        .iter()
        .filter(|e| e.event_type == AuditEventType::StepCompensated)
        .filter_map(|e| e.payload["step_id"].as_str())
        .collect();
    assert_eq!(compensated, vec!["B", "A"]);
    assert_eq!(count(&history, AuditEventType::StepFailed), 1);
    steward.shutdown().await;
}

#[tokio::test]
async fn test_compensation_error_freezes_instance() {
    let actor = Arc::new(ScriptedActor {
        fail_compensation: vec!["A".to_string()],
        ..ScriptedActor::default()
    });
    let steward = builder()
        .with_actor("worker", Arc::clone(&actor) as Arc<dyn Actor>)
        .start()
        .await
        .unwrap();
    steward
        .policies
        .publish(
            "saga",
            vec![
                StepSpec::new("A", "worker", HOUR).with_compensation(serde_json::json!("undo-a")),
                StepSpec::new("B", "external", HOUR),
            ],
            None,
        )
        .await
        .unwrap();
    let id = steward
        .engine
        .start_workflow("saga", serde_json::Value::Null)
        .await
        .unwrap()
        .instance_id;

    // Wait for A to complete through the worker pool
    for _ in 0..500 {
        let view = steward.engine.instance(&id).await.unwrap();
        if view.instance.current_step_index == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let err = steward.engine.fail_step(&id, "B", "remote error").await.unwrap_err();
    assert!(matches!(err, StewardError::CompensationFailure { ref step_id, .. } if step_id == "A"));

    let view = steward.engine.instance(&id).await.unwrap();
    assert_eq!(view.instance.status, InstanceStatus::FailedNeedsManual);
    let history = steward.engine.history(&id).await.unwrap();
    assert_eq!(count(&history, AuditEventType::CompensationFailed), 1);
    assert_eq!(count(&history, AuditEventType::InstanceFailedNeedsManual), 1);

    // Frozen instances accept no further signals
    assert!(!steward
        .engine
        .complete_step(&id, "B", serde_json::Value::Null)
        .await
        .unwrap()
        .is_applied());
    steward.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_completion_is_applied_once() {
    let steward = builder().start().await.unwrap();
    steward.policies.publish("P", review_policy(), None).await.unwrap();
    let id = steward
        .engine
        .start_workflow("P", serde_json::Value::Null)
        .await
        .unwrap()
        .instance_id;

    let engine = steward.engine.clone();
    let (first, second) = tokio::join!(
        engine.complete_step(&id, "draft", serde_json::json!(1)),
        steward.engine.complete_step(&id, "draft", serde_json::json!(2)),
    );
    let applied = [first.unwrap(), second.unwrap()]
        .iter()
        .filter(|t| t.is_applied())
        .count();
    assert_eq!(applied, 1);

    let history = steward.engine.history(&id).await.unwrap();
    assert_eq!(count(&history, AuditEventType::StepCompleted), 1);
    assert!(steward.engine.stats().ignored_signals >= 1);
    steward.shutdown().await;
}

#[tokio::test]
async fn test_abort_rejects_pending_ticket_and_is_terminal() {
    let steward = builder().start().await.unwrap();
    steward.policies.publish("P", review_policy(), None).await.unwrap();
    let id = steward
        .engine
        .start_workflow("P", serde_json::Value::Null)
        .await
        .unwrap()
        .instance_id;
    steward
        .engine
        .complete_step(&id, "draft", serde_json::Value::Null)
        .await
        .unwrap();
    let ticket_id = steward.engine.instance(&id).await.unwrap().instance.pending_ticket_id.unwrap();

    let t = steward
        .engine
        .abort(&id, Some("customer cancelled".to_string()))
        .await
        .unwrap();
    assert_eq!(t, Transition::Applied { status: InstanceStatus::Aborted });
    assert_eq!(
        steward.engine.ticket(&ticket_id).await.unwrap().status,
        TicketStatus::Rejected
    );
    assert_eq!(steward.timers.pending(), 0);

    let err = steward.engine.abort(&id, None).await.unwrap_err();
    assert!(matches!(
        err,
        StewardError::InvalidState { state: InstanceStatus::Aborted, .. }
    ));
    steward.shutdown().await;
}

#[tokio::test]
async fn test_rollback_affects_only_new_instances() {
    let steward = builder().start().await.unwrap();
    let steps = || vec![StepSpec::new("deploy", "ops", HOUR)];
    steward.policies.publish("P", steps(), None).await.unwrap();
    steward.policies.publish("P", steps(), None).await.unwrap();

    let survivor = steward
        .engine
        .start_workflow("P", serde_json::Value::Null)
        .await
        .unwrap();
    assert_eq!(survivor.pinned_version(), 2);

    for _ in 0..60 {
        let id = steward
            .engine
            .start_workflow("P", serde_json::Value::Null)
            .await
            .unwrap()
            .instance_id;
        steward.engine.fail_step(&id, "deploy", "deploy failed").await.unwrap();
    }

    let watcher = durable_steward::RollbackWatcher::new(
        Arc::clone(&steward.policies),
        Arc::clone(&steward.audit),
        WatcherConfig {
            failure_threshold: 50,
            ..WatcherConfig::default()
        },
    );
    let decisions = watcher.poll(Utc::now()).await.unwrap();
    assert_eq!(decisions.len(), 1);
    assert_eq!(decisions[0].to_version, 1);

    let fresh = steward
        .engine
        .start_workflow("P", serde_json::Value::Null)
        .await
        .unwrap();
    assert_eq!(fresh.pinned_version(), 1);

    steward
        .engine
        .complete_step(&survivor.instance_id, "deploy", serde_json::Value::Null)
        .await
        .unwrap();
    let view = steward.engine.instance(&survivor.instance_id).await.unwrap();
    assert_eq!(view.instance.status, InstanceStatus::Done);
    assert_eq!(view.instance.pinned_version(), 2);
    steward.shutdown().await;
}

#[tokio::test]
async fn test_audit_sequence_is_gap_free() {
    let steward = builder().start().await.unwrap();
    steward.policies.publish("P", review_policy(), None).await.unwrap();
    for _ in 0..5 {
        let id = steward
            .engine
            .start_workflow("P", serde_json::Value::Null)
            .await
            .unwrap()
            .instance_id;
        steward
            .engine
            .complete_step(&id, "draft", serde_json::Value::Null)
            .await
            .unwrap();
    }

    let entries = steward.audit.read_from(1, usize::MAX).await.unwrap();
    assert!(!entries.is_empty());
    for (i, entry) in entries.iter().enumerate() {
        assert_eq!(entry.sequence_number, i as u64 + 1);
    }
    steward.shutdown().await;
}

struct FailingSurface;

#[async_trait]
impl TicketSurface for FailingSurface {
    async fn create_ticket(&self, _ticket: &durable_steward::Ticket) -> anyhow::Result<String> {
        anyhow::bail!("console offline")
    }
}

#[tokio::test]
async fn test_ticket_surface_error_still_pauses() {
    let steward = builder()
        .with_ticket_surface(Arc::new(FailingSurface))
        .with_engine_config(EngineConfig {
            worker_count: 1,
            ..EngineConfig::default()
        })
        .start()
        .await
        .unwrap();
    steward
        .policies
        .publish(
            "gate",
            vec![StepSpec::new("sign", "legal", HOUR).requiring_approval()],
            None,
        )
        .await
        .unwrap();
    let id = steward
        .engine
        .start_workflow("gate", serde_json::Value::Null)
        .await
        .unwrap()
        .instance_id;

    let view = steward.engine.instance(&id).await.unwrap();
    assert_eq!(view.instance.status, InstanceStatus::Paused);
    let history = steward.engine.history(&id).await.unwrap();
    let created = history
        .iter()
        .find(|e| e.event_type == AuditEventType::TicketCreated)
        .unwrap();
    assert_eq!(created.payload["surface"]["error"], "console offline");
    steward.shutdown().await;
}
