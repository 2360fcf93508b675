//! SLA escalation chains.
//!
//! A missed SLA never fails a step. It produces an [`EscalationNotice`] on
//! `workflow.sla_missed` for hop 0, then for each later hop after that
//! hop's delay, until the step resolves or the chain runs out.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::policy::{StepSpec, Version};

/// Payload of an `SLA_MISSED` audit entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationNotice {
    pub instance_id: String,
    pub policy_id: String,
    pub policy_version: Version,
    pub step_id: String,
    pub step_index: usize,
    /// Position in the escalation chain; 0 is the SLA expiry itself.
    pub hop: usize,
    /// Contact for this hop. `None` when the step declares no chain.
    pub contact: Option<String>,
    /// Whether another hop is scheduled after this one.
    pub more_hops: bool,
    pub missed_at: DateTime<Utc>,
}

/// The timer to arm after `hop` has been notified, if any.
#[must_use]
pub fn next_hop(step: &StepSpec, hop: usize) -> Option<(usize, Duration)> {
    step.escalation.get(hop + 1).map(|h| (hop + 1, h.delay))
}

/// Delay before `hop` fires, measured from the previous hop (or from step
/// start for hop 0).
#[must_use]
pub fn hop_delay(step: &StepSpec, hop: usize) -> Option<Duration> {
    if hop == 0 {
        Some(step.sla_duration)
    } else {
        step.escalation.get(hop).map(|h| h.delay)
    }
}

/// Contact notified at `hop`.
#[must_use]
pub fn hop_contact(step: &StepSpec, hop: usize) -> Option<String> {
    step.escalation.get(hop).map(|h| h.contact.clone())
}
