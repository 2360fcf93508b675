//! Append-only audit log.
//!
//! Every state transition in the system is recorded as an [`AuditEntry`]
//! with a strictly increasing, gap-free sequence number. The log is the
//! source of truth for replaying an instance's history and for the
//! [`EventFanOut`](crate::fanout::EventFanOut) replay capability.
//!
//! Backends implement the [`AuditLog`] trait. A single writer assigns
//! sequence numbers, so the log forms one partition with no gaps.

#[cfg(feature = "sqlite-backend")]
pub mod sqlite;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::policy::Version;

#[cfg(feature = "sqlite-backend")]
pub use sqlite::SqliteAuditLog;

/// Type of a recorded transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEventType {
    PolicyDrafted,
    PolicyPublished,
    PolicyRolledBack,
    InstanceStarted,
    StepStarted,
    StepDispatched,
    StepCompleted,
    StepFailed,
    StepCompensated,
    CompensationFailed,
    TicketCreated,
    TicketResolved,
    SlaMissed,
    InstancePaused,
    InstanceResumed,
    InstanceCompleted,
    AbortRequested,
    InstanceAborted,
    InstanceFailedNeedsManual,
}

impl AuditEventType {
    /// All event types, in declaration order.
    pub const ALL: [Self; 19] = [
        Self::PolicyDrafted,
        Self::PolicyPublished,
        Self::PolicyRolledBack,
        Self::InstanceStarted,
        Self::StepStarted,
        Self::StepDispatched,
        Self::StepCompleted,
        Self::StepFailed,
        Self::StepCompensated,
        Self::CompensationFailed,
        Self::TicketCreated,
        Self::TicketResolved,
        Self::SlaMissed,
        Self::InstancePaused,
        Self::InstanceResumed,
        Self::InstanceCompleted,
        Self::AbortRequested,
        Self::InstanceAborted,
        Self::InstanceFailedNeedsManual,
    ];

    /// Get the event type as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::PolicyDrafted => "POLICY_DRAFTED",
            Self::PolicyPublished => "POLICY_PUBLISHED",
            Self::PolicyRolledBack => "POLICY_ROLLED_BACK",
            Self::InstanceStarted => "INSTANCE_STARTED",
            Self::StepStarted => "STEP_STARTED",
            Self::StepDispatched => "STEP_DISPATCHED",
            Self::StepCompleted => "STEP_COMPLETED",
            Self::StepFailed => "STEP_FAILED",
            Self::StepCompensated => "STEP_COMPENSATED",
            Self::CompensationFailed => "COMPENSATION_FAILED",
            Self::TicketCreated => "TICKET_CREATED",
            Self::TicketResolved => "TICKET_RESOLVED",
            Self::SlaMissed => "SLA_MISSED",
            Self::InstancePaused => "INSTANCE_PAUSED",
            Self::InstanceResumed => "INSTANCE_RESUMED",
            Self::InstanceCompleted => "INSTANCE_COMPLETED",
            Self::AbortRequested => "ABORT_REQUESTED",
            Self::InstanceAborted => "INSTANCE_ABORTED",
            Self::InstanceFailedNeedsManual => "INSTANCE_FAILED_NEEDS_MANUAL",
        }
    }

    /// Fan-out topics this event is published on.
    ///
    /// Policy-level events go to `policy.<id>.*`, instance events to
    /// `workflow.<policyId>.*`. SLA misses share one global topic so
    /// escalation consumers need a single subscription.
    #[must_use]
    pub fn topics(&self, policy_id: &str) -> Vec<String> {
        match self {
            Self::PolicyDrafted => vec![format!("policy.{policy_id}.drafted")],
            Self::PolicyPublished => vec![format!("policy.{policy_id}.changed")],
            Self::PolicyRolledBack => vec![
                format!("policy.{policy_id}.changed"),
                format!("workflow.{policy_id}.rolled_back"),
            ],
            Self::SlaMissed => vec!["workflow.sla_missed".to_string()],
            other => vec![format!(
                "workflow.{policy_id}.{}",
                other.as_str().to_ascii_lowercase()
            )],
        }
    }
}

impl fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditEventType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("Unknown audit event type: {s}"))
    }
}

/// A recorded, immutable transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Strictly increasing, gap-free sequence number starting at 1.
    pub sequence_number: u64,
    pub timestamp: DateTime<Utc>,
    /// `None` for policy-level events.
    pub instance_id: Option<String>,
    pub policy_id: Option<String>,
    pub policy_version: Option<Version>,
    pub event_type: AuditEventType,
    pub payload: serde_json::Value,
}

/// An entry waiting to be appended. The log assigns the sequence number
/// and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAuditEntry {
    pub instance_id: Option<String>,
    pub policy_id: Option<String>,
    pub policy_version: Option<Version>,
    pub event_type: AuditEventType,
    pub payload: serde_json::Value,
}

impl NewAuditEntry {
    /// Entry for a policy-level event.
    #[must_use]
    pub fn policy(event_type: AuditEventType, policy_id: &str, version: Version) -> Self {
        Self {
            instance_id: None,
            policy_id: Some(policy_id.to_string()),
            policy_version: Some(version),
            event_type,
            payload: serde_json::Value::Null,
        }
    }

    /// Entry for an instance-level event.
    #[must_use]
    pub fn instance(
        event_type: AuditEventType,
        instance_id: &str,
        policy_id: &str,
        version: Version,
    ) -> Self {
        Self {
            instance_id: Some(instance_id.to_string()),
            policy_id: Some(policy_id.to_string()),
            policy_version: Some(version),
            event_type,
            payload: serde_json::Value::Null,
        }
    }

    /// Attach a payload.
    #[must_use]
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Stamp the entry with its sequence number and timestamp.
    #[must_use]
    pub fn into_entry(self, sequence_number: u64, timestamp: DateTime<Utc>) -> AuditEntry {
        AuditEntry {
            sequence_number,
            timestamp,
            instance_id: self.instance_id,
            policy_id: self.policy_id,
            policy_version: self.policy_version,
            event_type: self.event_type,
            payload: self.payload,
        }
    }
}

/// Append-only audit log.
///
/// Implementations must guarantee:
/// - Sequence numbers start at 1 and have no gaps
/// - Entries are never mutated or deleted
/// - `read_from` returns entries in sequence order
#[async_trait]
pub trait AuditLog: Send + Sync {
    /// Append an entry and return it stamped with its sequence number.
    async fn append(&self, entry: NewAuditEntry) -> anyhow::Result<AuditEntry>;

    /// Read up to `limit` entries starting at `sequence_number` (inclusive).
    async fn read_from(&self, sequence_number: u64, limit: usize)
        -> anyhow::Result<Vec<AuditEntry>>;

    /// All entries for one workflow instance, in order.
    async fn for_instance(&self, instance_id: &str) -> anyhow::Result<Vec<AuditEntry>>;

    /// Sequence number of the most recent entry (0 when empty).
    async fn last_sequence(&self) -> anyhow::Result<u64>;
}

/// In-memory audit log for testing and single-process deployments.
#[derive(Debug, Default)]
pub struct InMemoryAuditLog {
    entries: parking_lot::RwLock<Vec<AuditEntry>>,
}

impl InMemoryAuditLog {
    /// Create a new in-memory audit log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries recorded.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the log is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl AuditLog for InMemoryAuditLog {
    async fn append(&self, entry: NewAuditEntry) -> anyhow::Result<AuditEntry> {
        // Sequence assignment and push happen under one write lock
        let mut entries = self.entries.write();
        let stamped = entry.into_entry(entries.len() as u64 + 1, Utc::now());
        entries.push(stamped.clone());
        Ok(stamped)
    }

    async fn read_from(
        &self,
        sequence_number: u64,
        limit: usize,
    ) -> anyhow::Result<Vec<AuditEntry>> {
        let entries = self.entries.read();
        let start = usize::try_from(sequence_number.saturating_sub(1)).unwrap_or(usize::MAX);
        Ok(entries.iter().skip(start).take(limit).cloned().collect())
    }

    async fn for_instance(&self, instance_id: &str) -> anyhow::Result<Vec<AuditEntry>> {
        let entries = self.entries.read();
        Ok(entries
            .iter()
            .filter(|e| e.instance_id.as_deref() == Some(instance_id))
            .cloned()
            .collect())
    }

    async fn last_sequence(&self) -> anyhow::Result<u64> {
        Ok(self.entries.read().len() as u64)
    }
}
