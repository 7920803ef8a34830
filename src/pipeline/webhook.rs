//! HTTP webhook pipeline: posts each batch as JSON to a downstream service.
//!
//! The response body must carry an explicit `success` boolean; a 2xx status
//! alone is not treated as success.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use super::types::{ConversationContext, PipelineOutcome, ProcessingPipeline};
use crate::error::PipelineError;
use crate::store::model::{SenderRole, StoredMessage};

/// Pipeline that delivers batches to an HTTP endpoint.
pub struct WebhookPipeline {
    url: String,
    token: Option<SecretString>,
    client: reqwest::Client,
}

impl WebhookPipeline {
    pub fn new(url: impl Into<String>, token: Option<SecretString>) -> Self {
        Self {
            url: url.into(),
            token,
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct WebhookMessage<'a> {
    id: Uuid,
    sender_role: SenderRole,
    body: &'a str,
    external_id: Option<&'a str>,
    created_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct WebhookRequest<'a> {
    participant_id: &'a str,
    conversation: &'a ConversationContext,
    messages: Vec<WebhookMessage<'a>>,
}

#[async_trait]
impl ProcessingPipeline for WebhookPipeline {
    async fn process(
        &self,
        participant_id: &str,
        messages: &[StoredMessage],
        context: &ConversationContext,
    ) -> Result<PipelineOutcome, PipelineError> {
        let body = WebhookRequest {
            participant_id,
            conversation: context,
            messages: messages
                .iter()
                .map(|m| WebhookMessage {
                    id: m.id,
                    sender_role: m.sender_role,
                    body: &m.body,
                    external_id: m.external_id.as_deref(),
                    created_at: m.created_at,
                })
                .collect(),
        };

        let mut request = self.client.post(&self.url).json(&body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.expose_secret());
        }

        let resp = request
            .send()
            .await
            .map_err(|e| PipelineError::Request(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(participant = participant_id, status = %status, "Pipeline webhook rejected batch");
            return Err(PipelineError::Request(format!("HTTP {status}: {text}")));
        }

        let outcome: PipelineOutcome = resp
            .json()
            .await
            .map_err(|e| PipelineError::InvalidResponse(e.to_string()))?;

        debug!(
            participant = participant_id,
            count = messages.len(),
            success = outcome.success,
            escalate = outcome.escalate,
            "Pipeline webhook responded"
        );
        Ok(outcome)
    }
}
