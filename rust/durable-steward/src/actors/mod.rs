//! External actors that perform step work.
//!
//! The engine never knows what a step does. It looks up the step's
//! `actor_role` in the [`ActorRegistry`] and hands the [`Actor`] an
//! [`ActorRequest`]. New kinds of work are added by registering another
//! implementation, not by changing the engine.
//!
//! Roles with no registered actor are *deferred*: the dispatch is only
//! announced on the fan-out and the surrounding system reports the result
//! later through [`WorkflowEngine::complete_step`] or
//! [`WorkflowEngine::fail_step`].
//!
//! [`WorkflowEngine::complete_step`]: crate::engine::WorkflowEngine::complete_step
//! [`WorkflowEngine::fail_step`]: crate::engine::WorkflowEngine::fail_step

#[cfg(feature = "webhook-actor")]
pub mod webhook;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::policy::Version;

#[cfg(feature = "webhook-actor")]
pub use webhook::WebhookActor;

/// Work handed to an actor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActorRequest {
    pub instance_id: String,
    pub policy_id: String,
    pub policy_version: Version,
    pub step_id: String,
    pub step_index: usize,
    pub actor_role: String,
    pub action: serde_json::Value,
    /// Instance context at dispatch time.
    pub context: serde_json::Value,
}

/// What an actor reports back from a dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "value", rename_all = "snake_case")]
pub enum ActorOutcome {
    /// Step finished; the value is merged into the instance context.
    Success(serde_json::Value),
    /// Step failed; triggers the compensation unwind.
    Failure(String),
    /// Accepted; the result will arrive through a completion callback.
    Deferred,
}

impl ActorOutcome {
    #[must_use]
    pub fn success(value: impl Serialize) -> Self {
        Self::Success(serde_json::to_value(value).unwrap_or(serde_json::Value::Null))
    }

    #[must_use]
    pub fn failure(reason: impl Into<String>) -> Self {
        Self::Failure(reason.into())
    }
}

/// A performer of steps for one or more roles.
#[async_trait]
pub trait Actor: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str {
        "actor"
    }

    /// Perform the step's action.
    async fn dispatch(&self, request: &ActorRequest) -> ActorOutcome;

    /// Undo a completed (or failed) step. Errors freeze the instance in
    /// `FAILED_NEEDS_MANUAL`.
    async fn compensate(
        &self,
        request: &ActorRequest,
        compensation: &serde_json::Value,
    ) -> anyhow::Result<serde_json::Value> {
        let _ = compensation;
        anyhow::bail!(
            "actor '{}' cannot compensate step '{}'",
            self.name(),
            request.step_id
        )
    }
}

/// Registry mapping actor roles to implementations.
#[derive(Default)]
pub struct ActorRegistry {
    actors: RwLock<HashMap<String, Arc<dyn Actor>>>,
}

impl fmt::Debug for ActorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorRegistry")
            .field("roles", &self.roles())
            .finish()
    }
}

impl ActorRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `actor` for `role`, replacing any previous registration.
    pub fn register(&self, role: impl Into<String>, actor: Arc<dyn Actor>) {
        let role = role.into();
        tracing::debug!(role = %role, actor = actor.name(), "Registered actor");
        self.actors.write().insert(role, actor);
    }

    /// Remove the actor for `role`.
    pub fn unregister(&self, role: &str) -> Option<Arc<dyn Actor>> {
        self.actors.write().remove(role)
    }

    #[must_use]
    pub fn get(&self, role: &str) -> Option<Arc<dyn Actor>> {
        self.actors.read().get(role).cloned()
    }

    /// Registered roles, sorted.
    #[must_use]
    pub fn roles(&self) -> Vec<String> {
        let mut roles: Vec<String> = self.actors.read().keys().cloned().collect();
        roles.sort();
        roles
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.actors.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actors.read().is_empty()
    }
}
