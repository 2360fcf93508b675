//! Durable state behind the policy store and engine.
//!
//! Logical tables:
//!
//! | Table | Key | Notes |
//! |-------|-----|-------|
//! | `policy_versions` | `(policy_id, version)` | steps stored as a blob |
//! | `policy_heads` | `policy_id` | current version + revision counter (CAS) |
//! | `workflow_instances` | `instance_id` | full instance state |
//! | `tickets` | `ticket_id` | human decision gates |
//!
//! The audit log lives behind its own trait in [`crate::audit`].

#[cfg(feature = "sqlite-backend")]
pub mod sqlite;

use std::collections::{BTreeMap, HashMap};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::engine::{Ticket, WorkflowInstance};
use crate::policy::{PolicyDefinition, PolicyStatus, Version};

#[cfg(feature = "sqlite-backend")]
pub use sqlite::SqliteStateStore;

/// The single "current version" row of a policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyHead {
    pub policy_id: String,
    pub current_version: Version,
    /// Bumped on every successful swap. A missing head reads as revision 0.
    pub revision: u64,
    pub updated_at: DateTime<Utc>,
}

/// An atomic move of a policy's current pointer.
///
/// Applied only if the head's revision still equals `expected_revision`.
/// On success `new_version` becomes `ACTIVE` and `previous` (if any) takes
/// `previous_status`, in the same critical section as the pointer move.
#[derive(Debug, Clone)]
pub struct HeadSwap {
    pub policy_id: String,
    pub expected_revision: u64,
    pub new_version: Version,
    pub previous: Option<Version>,
    pub previous_status: PolicyStatus,
    pub at: DateTime<Utc>,
}

/// Persistence for policies, instances and tickets.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Insert a new policy version. Returns `false` if that version already
    /// exists (another writer won the race).
    async fn insert_policy_version(&self, definition: &PolicyDefinition) -> Result<bool>;

    async fn policy_version(
        &self,
        policy_id: &str,
        version: Version,
    ) -> Result<Option<PolicyDefinition>>;

    /// All versions of a policy in ascending order.
    async fn policy_versions(&self, policy_id: &str) -> Result<Vec<PolicyDefinition>>;

    /// Highest version ever written for a policy, drafts included.
    async fn latest_version(&self, policy_id: &str) -> Result<Option<Version>>;

    async fn policy_head(&self, policy_id: &str) -> Result<Option<PolicyHead>>;

    /// Compare-and-swap the head. Returns the new head, or `None` if the
    /// revision moved.
    async fn swap_head(&self, swap: HeadSwap) -> Result<Option<PolicyHead>>;

    async fn list_policy_ids(&self) -> Result<Vec<String>>;

    async fn save_instance(&self, instance: &WorkflowInstance) -> Result<()>;

    async fn load_instance(&self, instance_id: &str) -> Result<Option<WorkflowInstance>>;

    /// Instances that are not in a terminal state.
    async fn list_active_instances(&self) -> Result<Vec<WorkflowInstance>>;

    async fn save_ticket(&self, ticket: &Ticket) -> Result<()>;

    async fn load_ticket(&self, ticket_id: &str) -> Result<Option<Ticket>>;
}

#[derive(Debug, Default)]
struct MemoryState {
    policies: HashMap<String, BTreeMap<Version, PolicyDefinition>>,
    heads: HashMap<String, PolicyHead>,
    instances: HashMap<String, WorkflowInstance>,
    tickets: HashMap<String, Ticket>,
}

/// In-memory state store for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    state: RwLock<MemoryState>,
}

impl MemoryStateStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn insert_policy_version(&self, definition: &PolicyDefinition) -> Result<bool> {
        let mut state = self.state.write();
        let versions = state.policies.entry(definition.policy_id.clone()).or_default();
        if versions.contains_key(&definition.version) {
            return Ok(false);
        }
        versions.insert(definition.version, definition.clone());
        Ok(true)
    }

    async fn policy_version(
        &self,
        policy_id: &str,
        version: Version,
    ) -> Result<Option<PolicyDefinition>> {
        Ok(self
            .state
            .read()
            .policies
            .get(policy_id)
            .and_then(|v| v.get(&version))
            .cloned())
    }

    async fn policy_versions(&self, policy_id: &str) -> Result<Vec<PolicyDefinition>> {
        Ok(self
            .state
            .read()
            .policies
            .get(policy_id)
            .map(|v| v.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn latest_version(&self, policy_id: &str) -> Result<Option<Version>> {
        Ok(self
            .state
            .read()
            .policies
            .get(policy_id)
            .and_then(|v| v.keys().next_back().copied()))
    }

    async fn policy_head(&self, policy_id: &str) -> Result<Option<PolicyHead>> {
        Ok(self.state.read().heads.get(policy_id).cloned())
    }

    async fn swap_head(&self, swap: HeadSwap) -> Result<Option<PolicyHead>> {
        let mut state = self.state.write();
        let actual = state.heads.get(&swap.policy_id).map_or(0, |h| h.revision);
        if actual != swap.expected_revision {
            return Ok(None);
        }

        let versions = state
            .policies
            .get_mut(&swap.policy_id)
            .ok_or_else(|| anyhow::anyhow!("No versions stored for policy {}", swap.policy_id))?;
        let target = versions.get_mut(&swap.new_version).ok_or_else(|| {
            anyhow::anyhow!("Version {} of policy {} is not stored", swap.new_version, swap.policy_id)
        })?;
        target.status = PolicyStatus::Active;
        target.activated_at = Some(swap.at);
        if let Some(previous) = swap.previous.and_then(|v| versions.get_mut(&v)) {
            previous.status = swap.previous_status;
        }

        let head = PolicyHead {
            policy_id: swap.policy_id.clone(),
            current_version: swap.new_version,
            revision: actual + 1,
            updated_at: swap.at,
        };
        state.heads.insert(swap.policy_id, head.clone());
        Ok(Some(head))
    }

    async fn list_policy_ids(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self.state.read().policies.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn save_instance(&self, instance: &WorkflowInstance) -> Result<()> {
        self.state
            .write()
            .instances
            .insert(instance.instance_id.clone(), instance.clone());
        Ok(())
    }

    async fn load_instance(&self, instance_id: &str) -> Result<Option<WorkflowInstance>> {
        Ok(self.state.read().instances.get(instance_id).cloned())
    }

    async fn list_active_instances(&self) -> Result<Vec<WorkflowInstance>> {
        let mut active: Vec<WorkflowInstance> = self
            .state
            .read()
            .instances
            .values()
            .filter(|i| !i.status.is_terminal())
            .cloned()
            .collect();
        active.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(active)
    }

    async fn save_ticket(&self, ticket: &Ticket) -> Result<()> {
        self.state
            .write()
            .tickets
            .insert(ticket.ticket_id.clone(), ticket.clone());
        Ok(())
    }

    async fn load_ticket(&self, ticket_id: &str) -> Result<Option<Ticket>> {
        Ok(self.state.read().tickets.get(ticket_id).cloned())
    }
}
