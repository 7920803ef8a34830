//! Inbound event shape and ingestion outcomes.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::IngestError;
use crate::handoff::ReactivationReason;
use crate::store::model::SenderRole;

/// Longest accepted participant id.
pub const MAX_PARTICIPANT_ID_LEN: usize = 256;

fn default_sender_role() -> SenderRole {
    SenderRole::Customer
}

/// An event delivered by a channel adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    pub participant_id: String,
    pub body: String,
    #[serde(default = "default_sender_role")]
    pub sender_role: SenderRole,
    /// Channel-native message id. Retries carrying the same id are dropped.
    #[serde(default)]
    pub external_id: Option<String>,
}

impl InboundEvent {
    /// A customer message without a dedup id.
    pub fn customer(participant_id: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            participant_id: participant_id.into(),
            body: body.into(),
            sender_role: SenderRole::Customer,
            external_id: None,
        }
    }

    pub fn with_external_id(mut self, external_id: impl Into<String>) -> Self {
        self.external_id = Some(external_id.into());
        self
    }

    pub fn with_sender_role(mut self, role: SenderRole) -> Self {
        self.sender_role = role;
        self
    }

    /// Parse a raw JSON payload, mapping schema errors to `Malformed`.
    pub fn from_json(value: serde_json::Value) -> Result<Self, IngestError> {
        serde_json::from_value(value).map_err(|e| IngestError::Malformed(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), IngestError> {
        let participant = self.participant_id.trim();
        if participant.is_empty() {
            return Err(IngestError::Malformed("participant_id is empty".into()));
        }
        if participant.chars().count() > MAX_PARTICIPANT_ID_LEN {
            return Err(IngestError::Malformed(format!(
                "participant_id longer than {MAX_PARTICIPANT_ID_LEN} characters"
            )));
        }
        if self.body.trim().is_empty() {
            return Err(IngestError::Malformed("body is empty".into()));
        }
        if self
            .external_id
            .as_deref()
            .is_some_and(|id| id.trim().is_empty())
        {
            return Err(IngestError::Malformed("external_id is empty".into()));
        }
        Ok(())
    }
}

/// What happened to an inbound event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IngestOutcome {
    /// Stored. `buffered` is false for agent-authored messages.
    Accepted {
        message_id: Uuid,
        conversation_id: Uuid,
        buffered: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        reactivated: Option<ReactivationReason>,
    },
    /// An event with the same external id was already stored.
    Duplicate,
    /// Malformed event; logged and discarded.
    Dropped { reason: String },
}
