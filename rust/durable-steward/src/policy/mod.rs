//! Policy definitions and their versioned store.
//!
//! A policy is an ordered list of [`StepSpec`]s identified by a stable
//! `policy_id`. Each publish produces a new immutable [`PolicyDefinition`]
//! with a strictly higher [`Version`].

mod store;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{StewardError, StewardResult};

pub use store::{PolicyStore, RollbackOrigin};

/// Policy version number. Starts at 1.
pub type Version = u32;

/// Lifecycle status of a policy version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PolicyStatus {
    Draft,
    Active,
    Superseded,
    RolledBack,
}

impl PolicyStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "DRAFT",
            Self::Active => "ACTIVE",
            Self::Superseded => "SUPERSEDED",
            Self::RolledBack => "ROLLED_BACK",
        }
    }
}

impl fmt::Display for PolicyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PolicyStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DRAFT" => Ok(Self::Draft),
            "ACTIVE" => Ok(Self::Active),
            "SUPERSEDED" => Ok(Self::Superseded),
            "ROLLED_BACK" => Ok(Self::RolledBack),
            other => Err(anyhow::anyhow!("Unknown policy status: {other}")),
        }
    }
}

/// One hop of a step's escalation chain.
///
/// Hop 0 is notified when the SLA expires; hop `i` is notified `delay`
/// after hop `i - 1` if the step is still unresolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationHop {
    pub contact: String,
    #[serde(rename = "delay_ms", with = "duration_ms", default)]
    pub delay: Duration,
}

impl EscalationHop {
    pub fn new(contact: impl Into<String>, delay: Duration) -> Self {
        Self {
            contact: contact.into(),
            delay,
        }
    }
}

/// A single step of a policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    pub step_id: String,
    /// Logical identity of who performs the step (human role or service).
    pub actor_role: String,
    /// Opaque action descriptor handed to the actor.
    #[serde(default)]
    pub action: serde_json::Value,
    #[serde(rename = "sla_duration_ms", with = "duration_ms")]
    pub sla_duration: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensation_action: Option<serde_json::Value>,
    #[serde(default)]
    pub requires_human_approval: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub escalation: Vec<EscalationHop>,
}

impl StepSpec {
    pub fn new(step_id: impl Into<String>, actor_role: impl Into<String>, sla: Duration) -> Self {
        Self {
            step_id: step_id.into(),
            actor_role: actor_role.into(),
            action: serde_json::Value::Null,
            sla_duration: sla,
            compensation_action: None,
            requires_human_approval: false,
            escalation: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_action(mut self, action: serde_json::Value) -> Self {
        self.action = action;
        self
    }

    #[must_use]
    pub fn with_compensation(mut self, compensation: serde_json::Value) -> Self {
        self.compensation_action = Some(compensation);
        self
    }

    #[must_use]
    pub fn requiring_approval(mut self) -> Self {
        self.requires_human_approval = true;
        self
    }

    #[must_use]
    pub fn with_escalation(mut self, hop: EscalationHop) -> Self {
        self.escalation.push(hop);
        self
    }
}

/// An immutable policy version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyDefinition {
    pub policy_id: String,
    pub version: Version,
    pub steps: Vec<StepSpec>,
    pub rollback_target: Option<Version>,
    pub status: PolicyStatus,
    pub created_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
}

impl PolicyDefinition {
    /// Step at `index`, if any.
    #[must_use]
    pub fn step(&self, index: usize) -> Option<&StepSpec> {
        self.steps.get(index)
    }
}

/// Validate a policy id and step list before anything is written.
pub fn validate_steps(policy_id: &str, steps: &[StepSpec]) -> StewardResult<()> {
    if policy_id.trim().is_empty() {
        return Err(StewardError::validation("policy", "policy id must not be empty"));
    }
    if policy_id.contains(['.', '*', '#', '@']) {
        return Err(StewardError::validation(
            policy_id,
            "policy id must not contain '.', '*', '#' or '@'",
        ));
    }
    if steps.is_empty() {
        return Err(StewardError::validation(policy_id, "step list must not be empty"));
    }

    let mut seen = std::collections::HashSet::new();
    for step in steps {
        if step.step_id.trim().is_empty() {
            return Err(StewardError::validation(policy_id, "step id must not be empty"));
        }
        if !seen.insert(step.step_id.as_str()) {
            return Err(StewardError::validation(
                policy_id,
                format!("duplicate step id '{}'", step.step_id),
            ));
        }
        if step.actor_role.trim().is_empty() {
            return Err(StewardError::validation(
                policy_id,
                format!("step '{}' has no actor role", step.step_id),
            ));
        }
        if step.sla_duration.is_zero() {
            return Err(StewardError::validation(
                policy_id,
                format!("step '{}' must have an SLA duration > 0", step.step_id),
            ));
        }
        // Hop 0 fires at SLA expiry, so only later hops need a delay
        if let Some(hop) = step.escalation.iter().skip(1).find(|h| h.delay.is_zero()) {
            return Err(StewardError::validation(
                policy_id,
                format!(
                    "escalation hop '{}' of step '{}' must have a delay > 0",
                    hop.contact, step.step_id
                ),
            ));
        }
    }
    Ok(())
}

/// Serde adapter storing a [`Duration`] as integer milliseconds.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
