//! Ingestion gateway: persists inbound events and slides the participant's
//! buffer window.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::types::{InboundEvent, IngestOutcome};
use crate::config::SharedConfig;
use crate::error::Result;
use crate::handoff::HandoffManager;
use crate::store::Database;
use crate::store::model::{NewMessage, SenderRole, StoredMessage};

/// Entry point for channel adapters.
pub struct IngestionGateway {
    db: Arc<dyn Database>,
    handoff: Arc<HandoffManager>,
    config: SharedConfig,
}

impl IngestionGateway {
    pub fn new(db: Arc<dyn Database>, handoff: Arc<HandoffManager>, config: SharedConfig) -> Self {
        Self {
            db,
            handoff,
            config,
        }
    }

    pub async fn ingest(&self, event: InboundEvent) -> Result<IngestOutcome> {
        self.ingest_at(event, Utc::now()).await
    }

    /// Ingest an event as of `now`.
    ///
    /// Only storage failures surface as `Err`; malformed events and
    /// duplicates are outcomes.
    pub async fn ingest_at(
        &self,
        event: InboundEvent,
        now: DateTime<Utc>,
    ) -> Result<IngestOutcome> {
        if let Err(e) = event.validate() {
            warn!(participant = %event.participant_id, "Dropping inbound event: {e}");
            return Ok(IngestOutcome::Dropped {
                reason: e.to_string(),
            });
        }

        let participant_id = event.participant_id.trim();
        let external_id = event.external_id.as_deref().map(str::trim);

        // Checked before touching conversations so a retried event cannot
        // open a new thread after the original one was closed.
        if let Some(id) = external_id {
            if let Some(existing) = self.db.get_message_by_external_id(id).await? {
                debug!(participant = participant_id, external_id = id, "Duplicate event");
                self.requeue_duplicate(&existing, now).await?;
                return Ok(IngestOutcome::Duplicate);
            }
        }

        let conversation = self
            .db
            .ensure_active_conversation(participant_id, now)
            .await?;

        let is_customer = event.sender_role == SenderRole::Customer;
        let stored = self
            .db
            .insert_message(
                &NewMessage {
                    participant_id,
                    conversation_id: conversation.id,
                    sender_role: event.sender_role,
                    body: &event.body,
                    external_id,
                    processed: !is_customer,
                },
                now,
            )
            .await?;
        let Some(stored) = stored else {
            debug!(participant = participant_id, "Duplicate event (insert race)");
            if let Some(id) = external_id {
                if let Some(existing) = self.db.get_message_by_external_id(id).await? {
                    self.requeue_duplicate(&existing, now).await?;
                }
            }
            return Ok(IngestOutcome::Duplicate);
        };

        self.db.touch_conversation(conversation.id, now).await?;

        if !is_customer {
            debug!(
                participant = participant_id,
                conversation_id = %conversation.id,
                role = %event.sender_role,
                "Recorded agent message"
            );
            return Ok(IngestOutcome::Accepted {
                message_id: stored.id,
                conversation_id: conversation.id,
                buffered: false,
                reactivated: None,
            });
        }

        let config = self.config.read().await.clone();
        let extended = self
            .db
            .extend_buffer(participant_id, config.buffer_window, now)
            .await?;
        if !extended {
            // The buffer is claimed; the message is picked up when the
            // current holder completes.
            debug!(participant = participant_id, "Buffer claimed, window left untouched");
        }

        let reactivated = self
            .handoff
            .check_reactivation(&conversation, &config, now)
            .await?;

        debug!(
            participant = participant_id,
            message_id = %stored.id,
            conversation_id = %conversation.id,
            "Message ingested"
        );
        Ok(IngestOutcome::Accepted {
            message_id: stored.id,
            conversation_id: conversation.id,
            buffered: true,
            reactivated,
        })
    }

    /// A retry of an event whose first attempt stored the message but failed
    /// before the buffer was extended. An unprocessed customer message must
    /// still have a buffer entry or no sweep will ever pick it up.
    async fn requeue_duplicate(&self, existing: &StoredMessage, now: DateTime<Utc>) -> Result<()> {
        if existing.processed || existing.sender_role != SenderRole::Customer {
            return Ok(());
        }
        let window = self.config.read().await.buffer_window;
        if self
            .db
            .extend_buffer(&existing.participant_id, window, now)
            .await?
        {
            debug!(
                participant = %existing.participant_id,
                message_id = %existing.id,
                "Buffer restored for unprocessed duplicate"
            );
        }
        Ok(())
    }
}
