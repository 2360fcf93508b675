//! Workflow instance and ticket state.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::policy::Version;

/// Execution status of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Running,
    Paused,
    Done,
    Aborted,
    FailedNeedsManual,
}

impl InstanceStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Done => "DONE",
            Self::Aborted => "ABORTED",
            Self::FailedNeedsManual => "FAILED_NEEDS_MANUAL",
        }
    }

    /// Terminal states are immutable.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Aborted | Self::FailedNeedsManual)
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RUNNING" => Ok(Self::Running),
            "PAUSED" => Ok(Self::Paused),
            "DONE" => Ok(Self::Done),
            "ABORTED" => Ok(Self::Aborted),
            "FAILED_NEEDS_MANUAL" => Ok(Self::FailedNeedsManual),
            other => Err(anyhow::anyhow!("Unknown instance status: {other}")),
        }
    }
}

/// One execution of a specific policy version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub instance_id: String,
    pub policy_id: String,
    /// Captured at creation. Never reassigned.
    pinned_version: Version,
    pub current_step_index: usize,
    pub status: InstanceStatus,
    /// Caller payload plus step results under `steps.<step_id>`.
    pub context: serde_json::Value,
    pub pending_ticket_id: Option<String>,
    /// Escalation hops already notified for the current step.
    #[serde(default)]
    pub escalation_level: usize,
    /// Wall-clock deadline of the current step's timer, for recovery.
    #[serde(default)]
    pub timer_deadline: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Step whose compensation failed. Set only in `FAILED_NEEDS_MANUAL`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manual_step_id: Option<String>,
    /// Reason of a compensation unwind in progress. Signals are ignored
    /// while it is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unwinding: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowInstance {
    pub(crate) fn new(policy_id: &str, pinned_version: Version, context: serde_json::Value) -> Self {
        let now = Utc::now();
        let context = match context {
            serde_json::Value::Object(_) => context,
            serde_json::Value::Null => serde_json::json!({}),
            other => serde_json::json!({ "input": other }),
        };
        Self {
            instance_id: uuid::Uuid::new_v4().to_string(),
            policy_id: policy_id.to_string(),
            pinned_version,
            current_step_index: 0,
            status: InstanceStatus::Running,
            context,
            pending_ticket_id: None,
            escalation_level: 0,
            timer_deadline: None,
            last_error: None,
            manual_step_id: None,
            unwinding: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Policy version this instance executes.
    #[must_use]
    pub const fn pinned_version(&self) -> Version {
        self.pinned_version
    }

    /// Key of the SLA timer for a step of this instance.
    #[must_use]
    pub fn timer_key(&self, step_id: &str) -> String {
        format!("{}:{step_id}", self.instance_id)
    }

    pub(crate) fn set_status(&mut self, status: InstanceStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    /// Store a step result under `context.steps.<step_id>`.
    pub(crate) fn record_result(&mut self, step_id: &str, result: serde_json::Value) {
        if result.is_null() {
            return;
        }
        if let Some(root) = self.context.as_object_mut() {
            let steps = root
                .entry("steps")
                .or_insert_with(|| serde_json::json!({}));
            if let Some(steps) = steps.as_object_mut() {
                steps.insert(step_id.to_string(), result);
            }
        }
    }

    /// Shallow-merge `edits` into the context root.
    pub(crate) fn merge_edits(&mut self, edits: &serde_json::Value) {
        if let (Some(root), Some(edits)) = (self.context.as_object_mut(), edits.as_object()) {
            for (key, value) in edits {
                root.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Status of a human decision gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TicketStatus {
    Pending,
    Approved,
    Rejected,
    Edited,
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Approved => "APPROVED",
            Self::Rejected => "REJECTED",
            Self::Edited => "EDITED",
        };
        f.write_str(s)
    }
}

/// A pending or decided human approval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    pub ticket_id: String,
    pub instance_id: String,
    pub policy_id: String,
    pub step_id: String,
    pub step_index: usize,
    pub status: TicketStatus,
    pub decided_by: Option<String>,
    pub decision_timestamp: Option<DateTime<Utc>>,
    pub note: Option<String>,
    /// Context changes supplied with an `EDITED` decision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edits: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl Ticket {
    pub(crate) fn new(instance: &WorkflowInstance, step_id: &str) -> Self {
        Self {
            ticket_id: uuid::Uuid::new_v4().to_string(),
            instance_id: instance.instance_id.clone(),
            policy_id: instance.policy_id.clone(),
            step_id: step_id.to_string(),
            step_index: instance.current_step_index,
            status: TicketStatus::Pending,
            decided_by: None,
            decision_timestamp: None,
            note: None,
            edits: None,
            created_at: Utc::now(),
        }
    }
}

/// A decision on a ticket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketResolution {
    pub decision: TicketStatus,
    pub decided_by: String,
    #[serde(default)]
    pub note: Option<String>,
    /// Merged into the instance context when `decision` is `EDITED`.
    #[serde(default)]
    pub edits: Option<serde_json::Value>,
}

impl TicketResolution {
    pub fn approve(decided_by: impl Into<String>) -> Self {
        Self::new(TicketStatus::Approved, decided_by)
    }

    pub fn reject(decided_by: impl Into<String>) -> Self {
        Self::new(TicketStatus::Rejected, decided_by)
    }

    pub fn edit(decided_by: impl Into<String>, edits: serde_json::Value) -> Self {
        Self {
            edits: Some(edits),
            ..Self::new(TicketStatus::Edited, decided_by)
        }
    }

    fn new(decision: TicketStatus, decided_by: impl Into<String>) -> Self {
        Self {
            decision,
            decided_by: decided_by.into(),
            note: None,
            edits: None,
        }
    }

    #[must_use]
    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

/// Result of feeding a signal to an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "transition", rename_all = "snake_case")]
pub enum Transition {
    /// State changed; the instance is now in this status.
    Applied { status: InstanceStatus },
    /// Stale or duplicate signal; nothing changed.
    Ignored { reason: String },
}

impl Transition {
    pub(crate) fn ignored(reason: impl Into<String>) -> Self {
        Self::Ignored {
            reason: reason.into(),
        }
    }

    #[must_use]
    pub const fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

/// Instance state as exposed to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceView {
    #[serde(flatten)]
    pub instance: WorkflowInstance,
    pub current_step_id: Option<String>,
    pub total_steps: usize,
    pub pending_ticket: Option<Ticket>,
}
