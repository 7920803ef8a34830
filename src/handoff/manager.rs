//! Persisted handoff transitions.
//!
//! Every transition is a conditional update on the state observed when it
//! was decided, so concurrent callers produce exactly one change.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use super::policy::evaluate_reactivation;
use super::state::{HandoffState, ReactivationReason};
use crate::config::CoordinatorConfig;
use crate::error::{Error, HandoffError};
use crate::store::Database;
use crate::store::model::{Conversation, ConversationStatus};

/// Applies handoff transitions for conversations.
pub struct HandoffManager {
    db: Arc<dyn Database>,
}

impl HandoffManager {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    async fn load(&self, conversation_id: Uuid) -> Result<Conversation, Error> {
        self.db
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| HandoffError::NotFound {
                id: conversation_id,
            })
            .map_err(Error::from)
    }

    fn check_transition(
        conversation: &Conversation,
        target: HandoffState,
    ) -> Result<(), HandoffError> {
        let current = HandoffState::of(conversation);
        if conversation.status.is_closed() || !current.can_transition_to(target) {
            return Err(HandoffError::InvalidTransition {
                id: conversation.id,
                state: if conversation.status.is_closed() {
                    conversation.status.to_string()
                } else {
                    current.to_string()
                },
                target: target.to_string(),
            });
        }
        Ok(())
    }

    /// automated → handoff-active. Returns the updated conversation.
    pub async fn activate(
        &self,
        conversation_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Conversation, Error> {
        let conversation = self.load(conversation_id).await?;
        Self::check_transition(&conversation, HandoffState::HandoffActive)?;

        if !self.db.activate_handoff(conversation_id, now).await? {
            // Lost a race with another transition
            let current = self.load(conversation_id).await?;
            return Err(HandoffError::InvalidTransition {
                id: conversation_id,
                state: HandoffState::of(&current).to_string(),
                target: HandoffState::HandoffActive.to_string(),
            }
            .into());
        }

        info!(
            conversation_id = %conversation_id,
            participant = %conversation.participant_id,
            "Handoff activated"
        );
        self.load(conversation_id).await
    }

    /// handoff-active → automated, by operator request.
    pub async fn deactivate(&self, conversation_id: Uuid) -> Result<Conversation, Error> {
        let conversation = self.load(conversation_id).await?;
        Self::check_transition(&conversation, HandoffState::Automated)?;

        let ended = match conversation.handoff_started_at {
            Some(started) => {
                self.db
                    .end_handoff(conversation_id, started, ConversationStatus::Active)
                    .await?
            }
            None => false,
        };
        if !ended {
            let current = self.load(conversation_id).await?;
            return Err(HandoffError::InvalidTransition {
                id: conversation_id,
                state: HandoffState::of(&current).to_string(),
                target: HandoffState::Automated.to_string(),
            }
            .into());
        }

        info!(conversation_id = %conversation_id, "Handoff deactivated by operator");
        self.load(conversation_id).await
    }

    /// Run the reactivation rules for a conversation and persist the result.
    ///
    /// Returns the reason when this call flipped the conversation back to
    /// automated.
    pub async fn check_reactivation(
        &self,
        conversation: &Conversation,
        config: &CoordinatorConfig,
        now: DateTime<Utc>,
    ) -> Result<Option<ReactivationReason>, Error> {
        let Some(started) = conversation.handoff_started_at else {
            return Ok(None);
        };
        if !conversation.handoff_active {
            return Ok(None);
        }

        let agent_replied = self
            .db
            .has_human_agent_message_since(conversation.id, started)
            .await?;
        let Some(reason) = evaluate_reactivation(conversation, agent_replied, config, now) else {
            return Ok(None);
        };

        if self
            .db
            .end_handoff(conversation.id, started, ConversationStatus::Active)
            .await?
        {
            info!(
                conversation_id = %conversation.id,
                participant = %conversation.participant_id,
                reason = %reason,
                "Handoff reactivated to automated"
            );
            Ok(Some(reason))
        } else {
            debug!(conversation_id = %conversation.id, "Reactivation already applied elsewhere");
            Ok(None)
        }
    }

    /// Persisted handoff state. Reactivation is decided on inbound
    /// messages only, so this never applies a transition.
    pub async fn current_state(
        &self,
        conversation_id: Uuid,
    ) -> Result<(Conversation, HandoffState), Error> {
        let conversation = self.load(conversation_id).await?;
        let state = HandoffState::of(&conversation);
        Ok((conversation, state))
    }
}
