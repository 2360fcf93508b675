//! HTTP webhook actor.
//!
//! POSTs the step to a fixed URL:
//!
//! ```json
//! {"kind": "dispatch", "instance_id": "...", "step_id": "...", "action": {...}, "context": {...}}
//! ```
//!
//! - `202 Accepted`: deferred, the remote side calls back later
//! - other 2xx: success, the JSON body (or `null`) is the step result
//! - anything else, or a transport error: failure
//!
//! Compensation uses the same URL with `"kind": "compensate"`.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;

use super::{Actor, ActorOutcome, ActorRequest};

/// Default request timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Actor that forwards steps to an HTTP endpoint.
pub struct WebhookActor {
    url: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for WebhookActor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookActor").field("url", &self.url).finish()
    }
}

impl WebhookActor {
    /// Create a webhook actor with the default timeout.
    pub fn new(url: impl Into<String>) -> anyhow::Result<Self> {
        Self::with_timeout(url, DEFAULT_TIMEOUT)
    }

    /// Create a webhook actor with a custom request timeout.
    pub fn with_timeout(url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let url = url.into();
        if !url.starts_with("http://") && !url.starts_with("https://") {
            anyhow::bail!("Invalid webhook URL scheme (must be http or https): {url}");
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build webhook HTTP client")?;
        Ok(Self { url, client })
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    fn body(kind: &str, request: &ActorRequest, action: &serde_json::Value) -> serde_json::Value {
        serde_json::json!({
            "kind": kind,
            "instance_id": request.instance_id,
            "policy_id": request.policy_id,
            "policy_version": request.policy_version,
            "step_id": request.step_id,
            "actor_role": request.actor_role,
            "action": action,
            "context": request.context,
        })
    }

    async fn read_json(response: reqwest::Response) -> serde_json::Value {
        let text = response.text().await.unwrap_or_default();
        if text.trim().is_empty() {
            return serde_json::Value::Null;
        }
        serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text))
    }
}

#[async_trait]
impl Actor for WebhookActor {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn dispatch(&self, request: &ActorRequest) -> ActorOutcome {
        tracing::debug!(
            instance_id = %request.instance_id,
            step_id = %request.step_id,
            url = %self.url,
            "Dispatching step to webhook"
        );

        let response = match self
            .client
            .post(&self.url)
            .json(&Self::body("dispatch", request, &request.action))
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => return ActorOutcome::failure(format!("HTTP error: {e}")),
        };

        let status = response.status();
        if status == StatusCode::ACCEPTED {
            return ActorOutcome::Deferred;
        }
        if !status.is_success() {
            return ActorOutcome::failure(format!("HTTP {status} from {}", self.url));
        }
        ActorOutcome::Success(Self::read_json(response).await)
    }

    async fn compensate(
        &self,
        request: &ActorRequest,
        compensation: &serde_json::Value,
    ) -> anyhow::Result<serde_json::Value> {
        let response = self
            .client
            .post(&self.url)
            .json(&Self::body("compensate", request, compensation))
            .send()
            .await
            .with_context(|| format!("Compensation request to {} failed", self.url))?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("HTTP {status} from {} during compensation", self.url);
        }
        Ok(Self::read_json(response).await)
    }
}
