//! Automatic rollback on failure spikes.
//!
//! The watcher tails the audit log from a cursor and keeps a sliding window
//! of per-instance outcomes. For each policy it looks only at instances
//! pinned to the current version: once the number of failed instances in
//! the window reaches `failure_threshold` and failed / attempted reaches
//! `failure_rate_threshold`, it rolls the policy back through the
//! [`PolicyStore`]. Running instances are never touched.
//!
//! Any rollback of a policy, manual or automatic, suspends auto-rollback
//! for that policy for `cooldown_secs`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::audit::{AuditEntry, AuditEventType, AuditLog};
use crate::config::WatcherConfig;
use crate::error::{StewardError, StewardResult};
use crate::policy::{PolicyStore, RollbackOrigin, Version};

const PAGE_SIZE: usize = 500;

/// An automatic rollback performed by the watcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackDecision {
    pub policy_id: String,
    pub from_version: Version,
    pub to_version: Version,
    pub failed_instances: usize,
    pub attempted_instances: usize,
    pub failure_rate: f64,
    pub decided_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Observation {
    at: DateTime<Utc>,
    policy_id: String,
    version: Version,
    instance_id: String,
    failed: bool,
}

#[derive(Debug, Default)]
struct WatcherState {
    /// Next audit sequence number to read.
    cursor: u64,
    window: VecDeque<Observation>,
    last_rollback: HashMap<String, DateTime<Utc>>,
}

/// Background failure-rate monitor.
pub struct RollbackWatcher {
    policies: Arc<PolicyStore>,
    audit: Arc<dyn AuditLog>,
    config: WatcherConfig,
    state: Mutex<WatcherState>,
}

impl fmt::Debug for RollbackWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RollbackWatcher")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RollbackWatcher {
    #[must_use]
    pub fn new(policies: Arc<PolicyStore>, audit: Arc<dyn AuditLog>, config: WatcherConfig) -> Self {
        Self {
            policies,
            audit,
            config,
            state: Mutex::new(WatcherState {
                cursor: 1,
                ..WatcherState::default()
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &WatcherConfig {
        &self.config
    }

    /// Ingest new audit entries, evaluate every policy seen in the window
    /// and roll back the ones over threshold.
    pub async fn poll(&self, now: DateTime<Utc>) -> StewardResult<Vec<RollbackDecision>> {
        self.ingest().await?;
        self.evict(now);

        let mut decisions = Vec::new();
        for policy_id in self.policies_in_window() {
            match self.evaluate(&policy_id, now).await {
                Ok(Some(decision)) => decisions.push(decision),
                Ok(None) => {}
                Err(StewardError::ConcurrencyConflict { .. }) => {
                    tracing::info!(policy_id = %policy_id, "Policy changed concurrently, skipping auto-rollback");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(decisions)
    }

    /// Run [`poll`](Self::poll) every `poll_interval` until `shutdown`.
    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let watcher = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(watcher.config.poll_interval());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tracing::info!(
                window_secs = watcher.config.window_secs,
                failure_threshold = watcher.config.failure_threshold,
                "Rollback watcher started"
            );
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = watcher.poll(Utc::now()).await {
                            tracing::error!(error = %e, "Rollback watcher poll failed");
                        }
                    }
                }
            }
            tracing::debug!("Rollback watcher stopped");
        })
    }

    async fn ingest(&self) -> StewardResult<()> {
        loop {
            let cursor = self.state.lock().cursor;
            let entries = self.audit.read_from(cursor, PAGE_SIZE).await?;
            let Some(last) = entries.last().map(|e| e.sequence_number) else {
                return Ok(());
            };

            let mut state = self.state.lock();
            for entry in &entries {
                Self::observe(&mut state, entry);
            }
            state.cursor = last + 1;
            if entries.len() < PAGE_SIZE {
                return Ok(());
            }
        }
    }

    fn observe(state: &mut WatcherState, entry: &AuditEntry) {
        let (Some(policy_id), Some(version)) = (entry.policy_id.as_ref(), entry.policy_version)
        else {
            return;
        };

        if entry.event_type == AuditEventType::PolicyRolledBack {
            state.last_rollback.insert(policy_id.clone(), entry.timestamp);
            return;
        }

        let failed = match entry.event_type {
            AuditEventType::StepFailed | AuditEventType::StepCompensated => true,
            AuditEventType::InstanceStarted
            | AuditEventType::StepCompleted
            | AuditEventType::InstanceCompleted => false,
            _ => return,
        };
        let Some(instance_id) = entry.instance_id.as_ref() else {
            return;
        };

        state.window.push_back(Observation {
            at: entry.timestamp,
            policy_id: policy_id.clone(),
            version,
            instance_id: instance_id.clone(),
            failed,
        });
    }

    fn evict(&self, now: DateTime<Utc>) {
        let Ok(window) = chrono::Duration::from_std(self.config.window()) else {
            return;
        };
        let horizon = now - window;
        let mut state = self.state.lock();
        while state.window.front().is_some_and(|o| o.at < horizon) {
            state.window.pop_front();
        }
    }

    fn policies_in_window(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut ids: Vec<String> = state
            .window
            .iter()
            .map(|o| o.policy_id.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        ids.sort();
        ids
    }

    /// Distinct failed and attempted instances of one policy version.
    fn counts(&self, policy_id: &str, version: Version) -> (usize, usize) {
        let state = self.state.lock();
        let mut attempted = HashSet::new();
        let mut failed = HashSet::new();
        for o in state
            .window
            .iter()
            .filter(|o| o.policy_id == policy_id && o.version == version)
        {
            attempted.insert(o.instance_id.as_str());
            if o.failed {
                failed.insert(o.instance_id.as_str());
            }
        }
        (failed.len(), attempted.len())
    }

    fn cooling_down(&self, policy_id: &str, now: DateTime<Utc>) -> bool {
        let Ok(cooldown) = chrono::Duration::from_std(self.config.cooldown()) else {
            return false;
        };
        let from_audit = self.state.lock().last_rollback.get(policy_id).copied();
        let last = from_audit.max(self.policies.last_manual_rollback(policy_id));
        last.is_some_and(|at| now < at + cooldown)
    }

    async fn evaluate(
        &self,
        policy_id: &str,
        now: DateTime<Utc>,
    ) -> StewardResult<Option<RollbackDecision>> {
        let Some(head) = self.policies.head(policy_id).await? else {
            return Ok(None);
        };
        let current = head.current_version;
        let (failed, attempted) = self.counts(policy_id, current);
        if attempted == 0 || failed < self.config.failure_threshold.max(1) {
            return Ok(None);
        }

        #[allow(clippy::cast_precision_loss, reason = "instance counts are far below 2^52")]
        let rate = failed as f64 / attempted as f64;
        if rate < self.config.failure_rate_threshold {
            return Ok(None);
        }
        if self.cooling_down(policy_id, now) {
            tracing::debug!(policy_id, failed, attempted, "Auto-rollback suppressed by cool-down");
            return Ok(None);
        }
        let Some(target) = self.policies.previous_version(policy_id).await? else {
            tracing::warn!(policy_id, current, failed, "Failure threshold exceeded but no earlier version to roll back to");
            return Ok(None);
        };

        tracing::warn!(
            policy_id,
            from_version = current,
            to_version = target,
            failed,
            attempted,
            rate,
            "Failure threshold exceeded, rolling back"
        );
        let new_head = self
            .policies
            .rollback_as(policy_id, target, RollbackOrigin::Automatic)
            .await?;
        self.state
            .lock()
            .last_rollback
            .insert(policy_id.to_string(), new_head.updated_at);

        Ok(Some(RollbackDecision {
            policy_id: policy_id.to_string(),
            from_version: current,
            to_version: target,
            failed_instances: failed,
            attempted_instances: attempted,
            failure_rate: rate,
            decided_at: now,
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::audit::{InMemoryAuditLog, NewAuditEntry};
    use crate::fanout::EventFanOut;
    use crate::journal::Journal;
    use crate::policy::StepSpec;
    use crate::storage::MemoryStateStore;

    struct Fixture {
        audit: Arc<InMemoryAuditLog>,
        policies: Arc<PolicyStore>,
        watcher: RollbackWatcher,
    }

    async fn fixture(config: WatcherConfig) -> Fixture {
        let audit = Arc::new(InMemoryAuditLog::new());
        let journal = Journal::new(
            Arc::clone(&audit) as Arc<dyn AuditLog>,
            EventFanOut::new(),
        );
        let policies = Arc::new(PolicyStore::new(Arc::new(MemoryStateStore::new()), journal));
        for _ in 0..2 {
            policies
                .publish(
                    "deploy",
                    vec![StepSpec::new("deploy", "ops", Duration::from_secs(60))],
                    None,
                )
                .await
                .unwrap();
        }
        let watcher = RollbackWatcher::new(
            Arc::clone(&policies),
            Arc::clone(&audit) as Arc<dyn AuditLog>,
            config,
        );
        Fixture {
            audit,
            policies,
            watcher,
        }
    }

    async fn outcome(audit: &InMemoryAuditLog, instance: &str, version: Version, failed: bool) {
        audit
            .append(NewAuditEntry::instance(
                AuditEventType::InstanceStarted,
                instance,
                "deploy",
                version,
            ))
            .await
            .unwrap();
        let event = if failed {
            AuditEventType::StepFailed
        } else {
            AuditEventType::StepCompleted
        };
        audit
            .append(NewAuditEntry::instance(event, instance, "deploy", version))
            .await
            .unwrap();
    }

    fn config(threshold: usize) -> WatcherConfig {
        WatcherConfig {
            failure_threshold: threshold,
            failure_rate_threshold: 0.5,
            ..WatcherConfig::default()
        }
    }

    #[tokio::test]
    async fn test_rolls_back_when_threshold_exceeded() {
        let f = fixture(config(5)).await;
        for i in 0..6 {
            outcome(&f.audit, &format!("wf-{i}"), 2, true).await;
        }
        outcome(&f.audit, "wf-ok", 2, false).await;

        let decisions = f.watcher.poll(Utc::now()).await.unwrap();
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].from_version, 2);
        assert_eq!(decisions[0].to_version, 1);
        assert_eq!(decisions[0].failed_instances, 6);
        assert_eq!(decisions[0].attempted_instances, 7);
        assert_eq!(f.policies.current_version("deploy").await.unwrap(), 1);

        // Second poll is idempotent: the window now targets v1
        assert!(f.watcher.poll(Utc::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_below_threshold_or_rate_does_nothing() {
        let f = fixture(config(5)).await;
        for i in 0..4 {
            outcome(&f.audit, &format!("wf-{i}"), 2, true).await;
        }
        assert!(f.watcher.poll(Utc::now()).await.unwrap().is_empty());

        // Enough failures but a low rate
        outcome(&f.audit, "wf-4", 2, true).await;
        for i in 0..20 {
            outcome(&f.audit, &format!("ok-{i}"), 2, false).await;
        }
        assert!(f.watcher.poll(Utc::now()).await.unwrap().is_empty());
        assert_eq!(f.policies.current_version("deploy").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_failures_of_older_versions_are_ignored() {
        let f = fixture(config(3)).await;
        for i in 0..10 {
            outcome(&f.audit, &format!("wf-{i}"), 1, true).await;
        }
        assert!(f.watcher.poll(Utc::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_manual_rollback_starts_cooldown() {
        let f = fixture(config(2)).await;
        f.policies
            .publish(
                "deploy",
                vec![StepSpec::new("deploy", "ops", Duration::from_secs(60))],
                None,
            )
            .await
            .unwrap();
        f.policies.rollback("deploy", 2).await.unwrap();

        for i in 0..5 {
            outcome(&f.audit, &format!("wf-{i}"), 2, true).await;
        }
        assert!(f.watcher.poll(Utc::now()).await.unwrap().is_empty());
        assert_eq!(f.policies.current_version("deploy").await.unwrap(), 2);

        // After the cool-down the same window triggers
        let later = Utc::now() + chrono::Duration::seconds(1000);
        let f2 = RollbackWatcher::new(
            Arc::clone(&f.policies),
            Arc::clone(&f.audit) as Arc<dyn AuditLog>,
            WatcherConfig {
                window_secs: 3600,
                ..config(2)
            },
        );
        let decisions = f2.poll(later).await.unwrap();
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].to_version, 1);
    }

    #[tokio::test]
    async fn test_old_observations_leave_the_window() {
        let f = fixture(config(3)).await;
        for i in 0..5 {
            outcome(&f.audit, &format!("wf-{i}"), 2, true).await;
        }
        let later = Utc::now() + chrono::Duration::seconds(301);
        assert!(f.watcher.poll(later).await.unwrap().is_empty());
        assert_eq!(f.policies.current_version("deploy").await.unwrap(), 2);
    }
}
