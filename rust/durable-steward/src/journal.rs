//! Audit-then-publish pipeline shared by the store, engine and watcher.

use std::fmt;
use std::sync::Arc;

use crate::audit::{AuditEntry, AuditLog, NewAuditEntry};
use crate::error::StewardResult;
use crate::fanout::EventFanOut;

/// Records transitions. An entry is published only after it has been
/// durably appended, so subscribers never see an event the log lacks.
#[derive(Clone)]
pub struct Journal {
    audit: Arc<dyn AuditLog>,
    fanout: EventFanOut,
}

impl fmt::Debug for Journal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Journal")
            .field("fanout", &self.fanout)
            .finish_non_exhaustive()
    }
}

impl Journal {
    #[must_use]
    pub fn new(audit: Arc<dyn AuditLog>, fanout: EventFanOut) -> Self {
        Self { audit, fanout }
    }

    /// Append `entry` to the audit log and fan it out.
    pub async fn record(&self, entry: NewAuditEntry) -> StewardResult<AuditEntry> {
        let entry = self.audit.append(entry).await?;
        tracing::debug!(
            sequence = entry.sequence_number,
            event_type = %entry.event_type,
            instance_id = entry.instance_id.as_deref().unwrap_or("-"),
            policy_id = entry.policy_id.as_deref().unwrap_or("-"),
            "Recorded audit entry"
        );
        self.fanout.publish_entry(&entry);
        Ok(entry)
    }

    #[must_use]
    pub fn audit(&self) -> &Arc<dyn AuditLog> {
        &self.audit
    }

    #[must_use]
    pub fn fanout(&self) -> &EventFanOut {
        &self.fanout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditEventType, InMemoryAuditLog};
    use crate::fanout::TopicPattern;

    #[tokio::test]
    async fn test_record_appends_then_publishes() {
        let audit = Arc::new(InMemoryAuditLog::new());
        let journal = Journal::new(Arc::clone(&audit) as Arc<dyn AuditLog>, EventFanOut::new());
        let mut sub = journal
            .fanout()
            .subscribe(TopicPattern::new("workflow.refund.step_completed").unwrap());

        let entry = journal
            .record(NewAuditEntry::instance(
                AuditEventType::StepCompleted,
                "wf-1",
                "refund",
                1,
            ))
            .await
            .unwrap();

        assert_eq!(audit.len(), 1);
        let envelope = sub.recv().await.unwrap();
        assert_eq!(envelope.sequence_number, Some(entry.sequence_number));
        assert_eq!(envelope.correlation_id.as_deref(), Some("wf-1"));
    }
}
