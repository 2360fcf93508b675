use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{validate_steps, PolicyDefinition, PolicyStatus, StepSpec, Version};
use crate::audit::{AuditEventType, NewAuditEntry};
use crate::error::{EntityKind, StewardError, StewardResult};
use crate::journal::Journal;
use crate::storage::{HeadSwap, PolicyHead, StateStore};

/// Who asked for a rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackOrigin {
    Manual,
    Automatic,
}

/// How a stale activation is reported.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Activation {
    /// Part of `publish`: losing to a newer version is a race.
    Publish,
    /// Explicit `activate` call on an existing draft.
    Explicit,
}

/// Versioned policy definitions with a compare-and-swap "current" pointer.
///
/// Versions are append-only. Each successful publish or rollback moves the
/// head through [`StateStore::swap_head`]; an unconditional caller retries a
/// lost race once before surfacing [`StewardError::ConcurrencyConflict`].
pub struct PolicyStore {
    state: Arc<dyn StateStore>,
    journal: Journal,
    manual_rollbacks: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl fmt::Debug for PolicyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyStore").finish_non_exhaustive()
    }
}

impl PolicyStore {
    #[must_use]
    pub fn new(state: Arc<dyn StateStore>, journal: Journal) -> Self {
        Self {
            state,
            journal,
            manual_rollbacks: Mutex::new(HashMap::new()),
        }
    }

    /// Store a new DRAFT version without moving the current pointer.
    pub async fn draft(
        &self,
        policy_id: &str,
        steps: Vec<StepSpec>,
        rollback_target: Option<Version>,
    ) -> StewardResult<PolicyDefinition> {
        validate_steps(policy_id, &steps)?;

        for attempt in 0..2 {
            let latest = self.state.latest_version(policy_id).await?;
            let version = latest.map_or(1, |v| v + 1);

            if let Some(target) = rollback_target {
                if target >= version {
                    return Err(StewardError::validation(
                        policy_id,
                        format!("rollback target {target} must be older than new version {version}"),
                    ));
                }
                if self.state.policy_version(policy_id, target).await?.is_none() {
                    return Err(StewardError::not_found(
                        EntityKind::PolicyVersion,
                        format!("{policy_id}@{target}"),
                    ));
                }
            }

            let definition = PolicyDefinition {
                policy_id: policy_id.to_string(),
                version,
                steps: steps.clone(),
                rollback_target,
                status: PolicyStatus::Draft,
                created_at: Utc::now(),
                activated_at: None,
            };

            if self.state.insert_policy_version(&definition).await? {
                self.journal
                    .record(
                        NewAuditEntry::policy(AuditEventType::PolicyDrafted, policy_id, version)
                            .with_payload(serde_json::json!({
                                "steps": definition.steps.iter().map(|s| &s.step_id).collect::<Vec<_>>(),
                                "rollback_target": rollback_target,
                            })),
                    )
                    .await?;
                tracing::debug!(policy_id, version, "Drafted policy version");
                return Ok(definition);
            }

            tracing::debug!(policy_id, version, attempt, "Version number taken, retrying");
        }

        let actual = self.state.latest_version(policy_id).await?.unwrap_or(0);
        Err(StewardError::ConcurrencyConflict {
            policy_id: policy_id.to_string(),
            expected: u64::from(actual.saturating_sub(1)),
            actual: u64::from(actual),
        })
    }

    /// Promote a DRAFT version to ACTIVE.
    ///
    /// With `expected_revision` the swap is attempted exactly once against
    /// that head revision; without it a lost race is retried once.
    pub async fn activate(
        &self,
        policy_id: &str,
        version: Version,
        expected_revision: Option<u64>,
    ) -> StewardResult<PolicyHead> {
        self.activate_with(policy_id, version, expected_revision, Activation::Explicit)
            .await
    }

    /// Validate, append and activate a new version. Returns its number.
    pub async fn publish(
        &self,
        policy_id: &str,
        steps: Vec<StepSpec>,
        rollback_target: Option<Version>,
    ) -> StewardResult<Version> {
        self.publish_expecting(policy_id, steps, rollback_target, None)
            .await
    }

    /// Like [`publish`](Self::publish) but fails with
    /// [`StewardError::ConcurrencyConflict`] unless the head is still at
    /// `expected_revision`.
    pub async fn publish_expecting(
        &self,
        policy_id: &str,
        steps: Vec<StepSpec>,
        rollback_target: Option<Version>,
        expected_revision: Option<u64>,
    ) -> StewardResult<Version> {
        // Fail fast before writing a draft that could never be activated
        if let Some(expected) = expected_revision {
            let actual = self.revision(policy_id).await?;
            if actual != expected {
                return Err(StewardError::ConcurrencyConflict {
                    policy_id: policy_id.to_string(),
                    expected,
                    actual,
                });
            }
        }

        let definition = self.draft(policy_id, steps, rollback_target).await?;
        self.activate_with(
            policy_id,
            definition.version,
            expected_revision,
            Activation::Publish,
        )
        .await?;
        Ok(definition.version)
    }

    async fn activate_with(
        &self,
        policy_id: &str,
        version: Version,
        expected_revision: Option<u64>,
        mode: Activation,
    ) -> StewardResult<PolicyHead> {
        let definition = self.get(policy_id, version).await?;
        if definition.status != PolicyStatus::Draft {
            return Err(StewardError::validation(
                format!("{policy_id}@{version}"),
                format!("only DRAFT versions can be activated (status is {})", definition.status),
            ));
        }

        let mut retried = false;
        loop {
            let head = self.state.policy_head(policy_id).await?;
            let revision = head.as_ref().map_or(0, |h| h.revision);
            let current = head.as_ref().map(|h| h.current_version);

            if let Some(expected) = expected_revision {
                if expected != revision {
                    return Err(StewardError::ConcurrencyConflict {
                        policy_id: policy_id.to_string(),
                        expected,
                        actual: revision,
                    });
                }
            }

            if let Some(current) = current.filter(|c| *c >= version) {
                return Err(match mode {
                    Activation::Publish => StewardError::ConcurrencyConflict {
                        policy_id: policy_id.to_string(),
                        expected: revision.saturating_sub(1),
                        actual: revision,
                    },
                    Activation::Explicit => StewardError::validation(
                        format!("{policy_id}@{version}"),
                        format!("version {version} is not newer than current version {current}"),
                    ),
                });
            }

            let swap = HeadSwap {
                policy_id: policy_id.to_string(),
                expected_revision: revision,
                new_version: version,
                previous: current,
                previous_status: PolicyStatus::Superseded,
                at: Utc::now(),
            };

            if let Some(new_head) = self.state.swap_head(swap).await? {
                self.journal
                    .record(
                        NewAuditEntry::policy(AuditEventType::PolicyPublished, policy_id, version)
                            .with_payload(serde_json::json!({
                                "previous_version": current,
                                "revision": new_head.revision,
                            })),
                    )
                    .await?;
                tracing::info!(
                    policy_id,
                    version,
                    previous = ?current,
                    revision = new_head.revision,
                    "Policy version activated"
                );
                return Ok(new_head);
            }

            if expected_revision.is_some() || retried {
                let actual = self.revision(policy_id).await?;
                return Err(StewardError::ConcurrencyConflict {
                    policy_id: policy_id.to_string(),
                    expected: revision,
                    actual,
                });
            }
            tracing::debug!(policy_id, version, "Lost head swap, retrying once");
            retried = true;
        }
    }

    /// Re-activate an earlier version. The replaced version becomes
    /// `ROLLED_BACK`.
    pub async fn rollback(&self, policy_id: &str, to_version: Version) -> StewardResult<PolicyHead> {
        self.rollback_as(policy_id, to_version, RollbackOrigin::Manual)
            .await
    }

    /// Rollback with an explicit origin. Manual rollbacks start the
    /// auto-rollback cool-down for the policy.
    pub async fn rollback_as(
        &self,
        policy_id: &str,
        to_version: Version,
        origin: RollbackOrigin,
    ) -> StewardResult<PolicyHead> {
        let mut retried = false;
        loop {
            let head = self
                .state
                .policy_head(policy_id)
                .await?
                .ok_or_else(|| StewardError::not_found(EntityKind::Policy, policy_id))?;
            let current = head.current_version;

            let target = self.state.policy_version(policy_id, to_version).await?;
            let target = match target {
                Some(t) if to_version < current => t,
                _ => {
                    return Err(StewardError::not_found(
                        EntityKind::PolicyVersion,
                        format!("{policy_id}@{to_version}"),
                    ))
                }
            };
            if target.status == PolicyStatus::Draft {
                return Err(StewardError::validation(
                    format!("{policy_id}@{to_version}"),
                    "cannot roll back to a version that was never activated",
                ));
            }

            let swap = HeadSwap {
                policy_id: policy_id.to_string(),
                expected_revision: head.revision,
                new_version: to_version,
                previous: Some(current),
                previous_status: PolicyStatus::RolledBack,
                at: Utc::now(),
            };

            if let Some(new_head) = self.state.swap_head(swap).await? {
                if origin == RollbackOrigin::Manual {
                    self.manual_rollbacks
                        .lock()
                        .insert(policy_id.to_string(), new_head.updated_at);
                }
                self.journal
                    .record(
                        NewAuditEntry::policy(AuditEventType::PolicyRolledBack, policy_id, to_version)
                            .with_payload(serde_json::json!({
                                "from_version": current,
                                "to_version": to_version,
                                "origin": origin,
                                "revision": new_head.revision,
                            })),
                    )
                    .await?;
                tracing::warn!(
                    policy_id,
                    from_version = current,
                    to_version,
                    ?origin,
                    "Policy rolled back"
                );
                return Ok(new_head);
            }

            if retried {
                let actual = self.revision(policy_id).await?;
                return Err(StewardError::ConcurrencyConflict {
                    policy_id: policy_id.to_string(),
                    expected: head.revision,
                    actual,
                });
            }
            tracing::debug!(policy_id, to_version, "Lost head swap, retrying rollback once");
            retried = true;
        }
    }

    /// The ACTIVE version. Read once when an instance is created.
    pub async fn current_version(&self, policy_id: &str) -> StewardResult<Version> {
        self.state
            .policy_head(policy_id)
            .await?
            .map(|h| h.current_version)
            .ok_or_else(|| StewardError::not_found(EntityKind::Policy, policy_id))
    }

    /// The ACTIVE definition.
    pub async fn current(&self, policy_id: &str) -> StewardResult<PolicyDefinition> {
        let version = self.current_version(policy_id).await?;
        self.get(policy_id, version).await
    }

    pub async fn get(&self, policy_id: &str, version: Version) -> StewardResult<PolicyDefinition> {
        self.state
            .policy_version(policy_id, version)
            .await?
            .ok_or_else(|| {
                StewardError::not_found(EntityKind::PolicyVersion, format!("{policy_id}@{version}"))
            })
    }

    /// All versions in ascending order.
    pub async fn versions(&self, policy_id: &str) -> StewardResult<Vec<PolicyDefinition>> {
        let versions = self.state.policy_versions(policy_id).await?;
        if versions.is_empty() {
            return Err(StewardError::not_found(EntityKind::Policy, policy_id));
        }
        Ok(versions)
    }

    pub async fn head(&self, policy_id: &str) -> StewardResult<Option<PolicyHead>> {
        Ok(self.state.policy_head(policy_id).await?)
    }

    pub async fn list(&self) -> StewardResult<Vec<String>> {
        Ok(self.state.list_policy_ids().await?)
    }

    /// Version an automatic rollback would return to: the current
    /// definition's `rollback_target`, else the newest activated version
    /// below the current one.
    pub async fn previous_version(&self, policy_id: &str) -> StewardResult<Option<Version>> {
        let current = self.current(policy_id).await?;
        let versions = self.state.policy_versions(policy_id).await?;
        let activated = |v: &PolicyDefinition| v.status != PolicyStatus::Draft;

        if let Some(target) = current.rollback_target {
            if versions
                .iter()
                .any(|v| v.version == target && target < current.version && activated(v))
            {
                return Ok(Some(target));
            }
        }

        Ok(versions
            .iter()
            .filter(|v| v.version < current.version && activated(v))
            .map(|v| v.version)
            .max())
    }

    /// When the last manual rollback of `policy_id` happened.
    #[must_use]
    pub fn last_manual_rollback(&self, policy_id: &str) -> Option<DateTime<Utc>> {
        self.manual_rollbacks.lock().get(policy_id).copied()
    }

    async fn revision(&self, policy_id: &str) -> StewardResult<u64> {
        Ok(self
            .state
            .policy_head(policy_id)
            .await?
            .map_or(0, |h| h.revision))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::audit::{AuditLog, InMemoryAuditLog};
    use crate::fanout::{EventFanOut, TopicPattern};
    use crate::storage::MemoryStateStore;

    fn store() -> (PolicyStore, Arc<InMemoryAuditLog>, EventFanOut) {
        let audit = Arc::new(InMemoryAuditLog::new());
        let fanout = EventFanOut::new();
        let journal = Journal::new(Arc::clone(&audit) as Arc<dyn AuditLog>, fanout.clone());
        let store = PolicyStore::new(Arc::new(MemoryStateStore::new()), journal);
        (store, audit, fanout)
    }

    fn steps(names: &[&str]) -> Vec<StepSpec> {
        names
            .iter()
            .map(|n| StepSpec::new(*n, "clerk", Duration::from_secs(3600)))
            .collect()
    }

    #[tokio::test]
    async fn test_publish_increments_version_and_supersedes() {
        let (store, _, _) = store();
        assert_eq!(store.publish("p", steps(&["a"]), None).await.unwrap(), 1);
        assert_eq!(store.publish("p", steps(&["a", "b"]), None).await.unwrap(), 2);
        assert_eq!(store.current_version("p").await.unwrap(), 2);

        let versions = store.versions("p").await.unwrap();
        assert_eq!(versions[0].status, PolicyStatus::Superseded);
        assert_eq!(versions[1].status, PolicyStatus::Active);
    }

    #[tokio::test]
    async fn test_publish_rejects_invalid_steps_without_writing() {
        let (store, audit, _) = store();
        let err = store.publish("p", vec![], None).await.unwrap_err();
        assert!(matches!(err, StewardError::Validation { .. }));
        assert!(audit.is_empty());
        assert!(matches!(
            store.current_version("p").await,
            Err(StewardError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_publish_emits_changed_event() {
        let (store, _, fanout) = store();
        let mut changed = fanout.subscribe(TopicPattern::new("policy.p.changed").unwrap());
        store.publish("p", steps(&["a"]), None).await.unwrap();
        let envelope = changed.recv().await.unwrap();
        assert_eq!(envelope.payload["event_type"], "POLICY_PUBLISHED");
        assert_eq!(envelope.payload["policy_version"], 1);
    }

    #[tokio::test]
    async fn test_expected_revision_mismatch_is_conflict() {
        let (store, _, _) = store();
        store.publish("p", steps(&["a"]), None).await.unwrap();
        let err = store
            .publish_expecting("p", steps(&["b"]), None, Some(0))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StewardError::ConcurrencyConflict { expected: 0, actual: 1, .. }
        ));
        assert_eq!(store.current_version("p").await.unwrap(), 1);

        let version = store
            .publish_expecting("p", steps(&["b"]), None, Some(1))
            .await
            .unwrap();
        assert_eq!(version, 2);
    }

    #[tokio::test]
    async fn test_draft_then_activate() {
        let (store, _, _) = store();
        store.publish("p", steps(&["a"]), None).await.unwrap();
        let draft = store.draft("p", steps(&["a", "b"]), Some(1)).await.unwrap();
        assert_eq!(draft.status, PolicyStatus::Draft);
        assert_eq!(store.current_version("p").await.unwrap(), 1);

        let head = store.activate("p", draft.version, None).await.unwrap();
        assert_eq!(head.current_version, 2);
        assert!(store.activate("p", draft.version, None).await.is_err());
    }

    #[tokio::test]
    async fn test_rollback_reactivates_older_version() {
        let (store, audit, _) = store();
        store.publish("p", steps(&["a"]), None).await.unwrap();
        store.publish("p", steps(&["a", "b"]), None).await.unwrap();

        let head = store.rollback("p", 1).await.unwrap();
        assert_eq!(head.current_version, 1);
        assert!(store.last_manual_rollback("p").is_some());

        let versions = store.versions("p").await.unwrap();
        assert_eq!(versions[0].status, PolicyStatus::Active);
        assert_eq!(versions[1].status, PolicyStatus::RolledBack);

        let last = audit.read_from(audit.last_sequence().await.unwrap(), 1).await.unwrap();
        assert_eq!(last[0].event_type, AuditEventType::PolicyRolledBack);
        assert_eq!(last[0].payload["from_version"], 2);

        // Versions keep increasing after a rollback
        assert_eq!(store.publish("p", steps(&["c"]), None).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_rollback_to_missing_or_newer_version_is_not_found() {
        let (store, _, _) = store();
        store.publish("p", steps(&["a"]), None).await.unwrap();
        store.publish("p", steps(&["b"]), None).await.unwrap();

        assert!(matches!(store.rollback("p", 7).await, Err(StewardError::NotFound { .. })));
        assert!(matches!(store.rollback("p", 2).await, Err(StewardError::NotFound { .. })));
        assert!(matches!(store.rollback("q", 1).await, Err(StewardError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_previous_version_prefers_rollback_target() {
        let (store, _, _) = store();
        store.publish("p", steps(&["a"]), None).await.unwrap();
        store.publish("p", steps(&["b"]), None).await.unwrap();
        store.publish("p", steps(&["c"]), Some(1)).await.unwrap();
        assert_eq!(store.previous_version("p").await.unwrap(), Some(1));

        store.publish("p", steps(&["d"]), None).await.unwrap();
        assert_eq!(store.previous_version("p").await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_concurrent_publishes_keep_one_active_version() {
        let (store, _, _) = store();
        let store = Arc::new(store);
        let mut handles = Vec::new();
        for i in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let name = format!("s{i}");
                store.publish("p", steps(&[name.as_str()]), None).await
            }));
        }

        let mut published = Vec::new();
        for handle in handles {
            match handle.await.unwrap() {
                Ok(v) => published.push(v),
                Err(StewardError::ConcurrencyConflict { .. }) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert!(!published.is_empty());

        let versions = store.versions("p").await.unwrap();
        let numbers: Vec<Version> = versions.iter().map(|v| v.version).collect();
        let mut sorted = numbers.clone();
        sorted.dedup();
        assert_eq!(numbers, sorted);
        assert_eq!(
            versions.iter().filter(|v| v.status == PolicyStatus::Active).count(),
            1
        );
    }
}
