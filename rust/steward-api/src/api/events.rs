//! Live topic subscriptions over Server-Sent Events.
//!
//! `GET /v1/events?topic=workflow.refund.*` streams every envelope whose
//! topic matches. With `from=<sequence>` the stream first replays matching
//! envelopes rebuilt from the audit log, then continues live without
//! repeating anything already replayed.

use std::convert::Infallible;

use axum::{
    extract::{Query, State},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    routing::get,
    Router,
};
use durable_steward::{EventEnvelope, StewardError, TopicPattern};
use futures::{Stream, StreamExt};
use serde::Deserialize;

use crate::error::ApiResult;
use crate::AppState;

/// Create the events router.
pub fn router() -> Router<AppState> {
    Router::new().route("/v1/events", get(subscribe))
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    /// Topic pattern; `*` matches one segment, a trailing `#` the rest.
    #[serde(default)]
    pub topic: Option<String>,
    /// Replay from this audit sequence number before going live.
    #[serde(default)]
    pub from: Option<u64>,
}

async fn subscribe(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<impl IntoResponse> {
    let pattern = match query.topic.as_deref() {
        Some(topic) => TopicPattern::new(topic)?,
        None => TopicPattern::all(),
    };

    // Subscribe before replaying so nothing falls between the two
    let live = state.fanout.subscribe(pattern.clone()).into_stream();
    let replayed = match query.from {
        Some(from) => state
            .fanout
            .replay(state.audit.as_ref(), from, &pattern)
            .await
            .map_err(StewardError::Storage)?,
        None => Vec::new(),
    };

    tracing::debug!(
        pattern = %pattern,
        replayed = replayed.len(),
        "Event subscription opened"
    );
    let live = live.take_until(state.shutdown.cancelled_owned());
    Ok(Sse::new(event_stream(pattern, replayed, live)).keep_alive(KeepAlive::default()))
}

fn event_stream(
    pattern: TopicPattern,
    replayed: Vec<EventEnvelope>,
    live: impl Stream<Item = EventEnvelope> + Send + 'static,
) -> impl Stream<Item = Result<Event, Infallible>> + Send + 'static {
    async_stream::stream! {
        yield Ok(Event::default()
            .event("connected")
            .data(serde_json::json!({ "topic": pattern.as_str() }).to_string()));

        let mut high_water = 0;
        for envelope in replayed {
            high_water = high_water.max(envelope.sequence_number.unwrap_or(0));
            yield Ok(to_event(&envelope));
        }

        let mut live = Box::pin(live);
        while let Some(envelope) = live.next().await {
            if envelope.sequence_number.is_some_and(|seq| seq <= high_water) {
                continue;
            }
            yield Ok(to_event(&envelope));
        }
    }
}

fn to_event(envelope: &EventEnvelope) -> Event {
    let event = Event::default().event(envelope.topic.clone());
    let event = match envelope.sequence_number {
        Some(seq) => event.id(seq.to_string()),
        None => event,
    };
    match serde_json::to_string(envelope) {
        Ok(data) => event.data(data),
        Err(e) => {
            tracing::warn!(topic = %envelope.topic, error = %e, "Envelope not serializable");
            event.data("{}")
        }
    }
}
