//! Topic-based publish/subscribe for external collaborators.
//!
//! Every audit entry is re-published as one or more [`EventEnvelope`]s on
//! dotted topics such as `workflow.refund.step_started`. Subscribers pick
//! topics with a [`TopicPattern`]:
//!
//! - `*` matches exactly one segment (`workflow.*.step_started`)
//! - a trailing `#` matches any remaining segments (`policy.#`)
//!
//! ```text
//! Journal ─> EventFanOut::publish ─> broadcast ─┬─> Subscription("workflow.sla_missed")
//!                                               └─> Subscription("policy.*.changed")
//! ```
//!
//! Live delivery is best-effort: a subscriber that falls more than
//! [`CHANNEL_CAPACITY`] envelopes behind skips the oldest ones. Missed
//! envelopes can always be rebuilt from the audit log with
//! [`EventFanOut::replay`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};

use crate::audit::{AuditEntry, AuditLog};
use crate::error::{StewardError, StewardResult};

/// Capacity of the broadcast channel.
pub const CHANNEL_CAPACITY: usize = 256;

/// Page size used when replaying from the audit log.
const REPLAY_PAGE: usize = 500;

/// A published notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub topic: String,
    /// The instance id for instance events; `None` for policy events.
    pub correlation_id: Option<String>,
    pub payload: serde_json::Value,
    pub emitted_at: DateTime<Utc>,
    /// Audit sequence number this envelope was derived from.
    pub sequence_number: Option<u64>,
}

impl EventEnvelope {
    /// Build the envelopes an audit entry is published as.
    #[must_use]
    pub fn from_entry(entry: &AuditEntry) -> Vec<Self> {
        let policy_id = entry.policy_id.as_deref().unwrap_or("_");
        let payload = serde_json::json!({
            "event_type": entry.event_type,
            "policy_id": entry.policy_id,
            "policy_version": entry.policy_version,
            "instance_id": entry.instance_id,
            "data": entry.payload,
        });

        entry
            .event_type
            .topics(policy_id)
            .into_iter()
            .map(|topic| Self {
                topic,
                correlation_id: entry.instance_id.clone(),
                payload: payload.clone(),
                emitted_at: entry.timestamp,
                sequence_number: Some(entry.sequence_number),
            })
            .collect()
    }
}

/// A subscription filter over dotted topics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    raw: String,
    segments: Vec<String>,
}

impl TopicPattern {
    /// Parse a pattern. Segments must be non-empty and `#` may only appear
    /// last.
    pub fn new(pattern: &str) -> StewardResult<Self> {
        let segments: Vec<String> = pattern.split('.').map(str::to_string).collect();
        if segments.iter().any(String::is_empty) {
            return Err(StewardError::validation(pattern, "topic pattern has an empty segment"));
        }
        if let Some(pos) = segments.iter().position(|s| s == "#") {
            if pos != segments.len() - 1 {
                return Err(StewardError::validation(
                    pattern,
                    "'#' is only allowed as the last segment",
                ));
            }
        }
        Ok(Self {
            raw: pattern.to_string(),
            segments,
        })
    }

    /// Pattern that matches every topic.
    #[must_use]
    pub fn all() -> Self {
        Self {
            raw: "#".to_string(),
            segments: vec!["#".to_string()],
        }
    }

    /// Check whether `topic` matches.
    #[must_use]
    pub fn matches(&self, topic: &str) -> bool {
        let mut parts = topic.split('.');
        for segment in &self.segments {
            if segment == "#" {
                return true;
            }
            match parts.next() {
                Some(part) if segment == "*" || segment == part => {}
                _ => return false,
            }
        }
        parts.next().is_none()
    }

    /// The pattern as written.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Receiving end of a topic subscription.
#[derive(Debug)]
pub struct Subscription {
    pattern: TopicPattern,
    rx: broadcast::Receiver<EventEnvelope>,
}

impl Subscription {
    /// Wait for the next matching envelope. Returns `None` once the fan-out
    /// is dropped.
    pub async fn recv(&mut self) -> Option<EventEnvelope> {
        loop {
            match self.rx.recv().await {
                Ok(envelope) if self.pattern.matches(&envelope.topic) => return Some(envelope),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        pattern = %self.pattern,
                        skipped,
                        "Subscriber lagged, envelopes dropped"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next matching envelope if one is already buffered.
    pub fn try_recv(&mut self) -> Option<EventEnvelope> {
        loop {
            match self.rx.try_recv() {
                Ok(envelope) if self.pattern.matches(&envelope.topic) => return Some(envelope),
                Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => {}
                Err(_) => return None,
            }
        }
    }

    /// The pattern this subscription filters on.
    #[must_use]
    pub fn pattern(&self) -> &TopicPattern {
        &self.pattern
    }

    /// Convert into a stream of matching envelopes. Lag gaps are skipped.
    pub fn into_stream(self) -> impl Stream<Item = EventEnvelope> + Send + 'static {
        let pattern = self.pattern;
        BroadcastStream::new(self.rx).filter_map(move |item| match item {
            Ok(envelope) if pattern.matches(&envelope.topic) => Some(envelope),
            Ok(_) => None,
            Err(err) => {
                tracing::warn!(pattern = %pattern, error = %err, "Subscriber stream lagged");
                None
            }
        })
    }
}

/// Broadcast hub for envelopes.
#[derive(Debug, Clone)]
pub struct EventFanOut {
    sender: broadcast::Sender<EventEnvelope>,
    published: Arc<AtomicU64>,
}

impl Default for EventFanOut {
    fn default() -> Self {
        Self::new()
    }
}

impl EventFanOut {
    /// Create a fan-out with the default channel capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(CHANNEL_CAPACITY)
    }

    /// Create a fan-out with a custom channel capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _rx) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            published: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish an envelope. Returns the number of live receivers; zero is
    /// not an error.
    pub fn publish(&self, envelope: EventEnvelope) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(topic = %envelope.topic, "Publishing envelope");
        self.sender.send(envelope).unwrap_or(0)
    }

    /// Publish every envelope derived from an audit entry.
    pub fn publish_entry(&self, entry: &AuditEntry) {
        for envelope in EventEnvelope::from_entry(entry) {
            self.publish(envelope);
        }
    }

    /// Subscribe to envelopes whose topic matches `pattern`.
    #[must_use]
    pub fn subscribe(&self, pattern: TopicPattern) -> Subscription {
        Subscription {
            pattern,
            rx: self.sender.subscribe(),
        }
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Total envelopes published.
    #[must_use]
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Rebuild the envelopes matching `pattern` from the audit log, starting
    /// at sequence `from` (inclusive). Nothing is re-broadcast.
    pub async fn replay(
        &self,
        audit: &dyn AuditLog,
        from: u64,
        pattern: &TopicPattern,
    ) -> anyhow::Result<Vec<EventEnvelope>> {
        let mut envelopes = Vec::new();
        let mut cursor = from.max(1);
        loop {
            let page = audit.read_from(cursor, REPLAY_PAGE).await?;
            let Some(last) = page.last() else { break };
            cursor = last.sequence_number + 1;
            envelopes.extend(
                page.iter()
                    .flat_map(EventEnvelope::from_entry)
                    .filter(|e| pattern.matches(&e.topic)),
            );
            if page.len() < REPLAY_PAGE {
                break;
            }
        }
        Ok(envelopes)
    }
}
