//! Error taxonomy for the orchestration core.

use std::fmt;

use thiserror::Error;

use crate::engine::InstanceStatus;

/// Kind of entity a lookup failed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Policy,
    PolicyVersion,
    Instance,
    Ticket,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Policy => "Policy",
            Self::PolicyVersion => "Policy version",
            Self::Instance => "Workflow instance",
            Self::Ticket => "Ticket",
        };
        f.write_str(name)
    }
}

/// Core error type for policy and workflow operations.
///
/// Every variant names the policy or instance it concerns so API callers
/// can surface a typed, actionable error.
#[derive(Error, Debug)]
pub enum StewardError {
    /// Malformed policy, step spec or request. Rejected before execution.
    #[error("Validation failed for '{subject}': {reason}")]
    Validation { subject: String, reason: String },

    /// Unknown policy, version, instance or ticket.
    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: String },

    /// Lost a compare-and-swap race on a policy's version pointer.
    #[error(
        "Concurrent modification of policy '{policy_id}': expected revision {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        policy_id: String,
        expected: u64,
        actual: u64,
    },

    /// Operation not permitted in the instance's current state.
    #[error("Cannot {operation} workflow '{instance_id}' in state {state}")]
    InvalidState {
        instance_id: String,
        state: InstanceStatus,
        operation: &'static str,
    },

    /// Unwind could not complete; the instance is frozen in `FAILED_NEEDS_MANUAL`.
    #[error("Compensation for step '{step_id}' of workflow '{instance_id}' failed: {reason}")]
    CompensationFailure {
        instance_id: String,
        step_id: String,
        reason: String,
    },

    /// Actor dispatch failed.
    #[error("Actor '{role}' failed step '{step_id}' of workflow '{instance_id}': {reason}")]
    ExternalActor {
        instance_id: String,
        step_id: String,
        role: String,
        reason: String,
    },

    /// Backend failure (audit log or state store).
    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

/// Result type alias for orchestration operations.
pub type StewardResult<T> = Result<T, StewardError>;

impl StewardError {
    /// Create a validation error.
    pub fn validation(subject: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            subject: subject.into(),
            reason: reason.into(),
        }
    }

    /// Create a not-found error.
    pub fn not_found(kind: EntityKind, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Stable machine-readable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation_error",
            Self::NotFound { .. } => "not_found",
            Self::ConcurrencyConflict { .. } => "concurrency_conflict",
            Self::InvalidState { .. } => "invalid_state",
            Self::CompensationFailure { .. } => "compensation_failure",
            Self::ExternalActor { .. } => "external_actor_error",
            Self::Storage(_) => "storage_error",
        }
    }

    /// Policy id the error concerns, if any.
    #[must_use]
    pub fn policy_id(&self) -> Option<&str> {
        match self {
            Self::ConcurrencyConflict { policy_id, .. } => Some(policy_id),
            Self::NotFound {
                kind: EntityKind::Policy | EntityKind::PolicyVersion,
                id,
            } => Some(id.split('@').next().unwrap_or(id)),
            _ => None,
        }
    }

    /// Instance id the error concerns, if any.
    #[must_use]
    pub fn instance_id(&self) -> Option<&str> {
        match self {
            Self::InvalidState { instance_id, .. }
            | Self::CompensationFailure { instance_id, .. }
            | Self::ExternalActor { instance_id, .. } => Some(instance_id),
            Self::NotFound {
                kind: EntityKind::Instance,
                id,
            } => Some(id),
            _ => None,
        }
    }

    /// Instance state at the time of the error, if known.
    #[must_use]
    pub fn state(&self) -> Option<InstanceStatus> {
        match self {
            Self::InvalidState { state, .. } => Some(*state),
            Self::CompensationFailure { .. } => Some(InstanceStatus::FailedNeedsManual),
            _ => None,
        }
    }
}
