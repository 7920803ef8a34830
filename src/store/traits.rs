//! Unified `Database` trait: single async interface for all persistence.
//!
//! The buffer methods `acquire`, `complete`, `release` and `reclaim_lock` are
//! the only statements that change `in_progress`. Each is one conditional
//! update (or one transaction for `complete`), never a read-then-write.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::model::{
    Alert, AlertKind, BufferEntry, Conversation, ConversationStatus, LockGrant, NewMessage,
    StoredMessage,
};

/// Backend-agnostic database trait covering buffers, messages, conversations,
/// alerts, and settings.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── Messages ────────────────────────────────────────────────────

    /// Insert a message. Returns `None` when the external id already exists.
    async fn insert_message(
        &self,
        message: &NewMessage<'_>,
        now: DateTime<Utc>,
    ) -> Result<Option<StoredMessage>, DatabaseError>;

    /// Look up a message by its external (channel-native) id.
    async fn get_message_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<StoredMessage>, DatabaseError>;

    /// All unprocessed messages for a participant, oldest first.
    async fn list_unprocessed_messages(
        &self,
        participant_id: &str,
    ) -> Result<Vec<StoredMessage>, DatabaseError>;

    /// Whether a human agent wrote in the conversation at or after `since`.
    async fn has_human_agent_message_since(
        &self,
        conversation_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    // ── Buffer ──────────────────────────────────────────────────────

    /// Create or slide the participant's buffer window to `now + window`.
    ///
    /// A claimed row (`in_progress = 1`) is left untouched. Returns whether
    /// the window was written.
    async fn extend_buffer(
        &self,
        participant_id: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    async fn get_buffer(&self, participant_id: &str)
    -> Result<Option<BufferEntry>, DatabaseError>;

    /// Participants whose window has expired and who are not claimed.
    async fn list_expired_buffers(&self, now: DateTime<Utc>) -> Result<Vec<String>, DatabaseError>;

    /// Pull an unclaimed window forward to `now` (forced sweep).
    async fn expire_window(
        &self,
        participant_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Claim the buffer iff it is unclaimed and its window has expired.
    async fn acquire(
        &self,
        participant_id: &str,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<LockGrant>, DatabaseError>;

    /// Mark `message_ids` processed and delete the buffer, iff `grant` still
    /// holds the lock. Leftover unprocessed messages get a fresh, already
    /// expired buffer in the same transaction.
    async fn complete(
        &self,
        grant: &LockGrant,
        message_ids: &[Uuid],
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Drop the lock and make the buffer immediately eligible, iff `grant`
    /// still holds it.
    async fn release(&self, grant: &LockGrant, now: DateTime<Utc>) -> Result<bool, DatabaseError>;

    /// Claimed buffers whose lock was acquired before `cutoff`.
    async fn list_stale_locks(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<BufferEntry>, DatabaseError>;

    /// Force-reset a stale lock, keyed on the observed owner and generation.
    async fn reclaim_lock(
        &self,
        participant_id: &str,
        observed_owner: &str,
        observed_generation: i64,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    // ── Conversations ───────────────────────────────────────────────

    /// Return the participant's open conversation, creating it if needed.
    async fn ensure_active_conversation(
        &self,
        participant_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Conversation, DatabaseError>;

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>, DatabaseError>;

    /// Move `last_activity_at` forward to `now` (never backwards).
    async fn touch_conversation(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), DatabaseError>;

    /// automated → handoff-active. Returns false if already active or closed.
    async fn activate_handoff(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, DatabaseError>;

    /// handoff-active → automated, setting `status`. Conditional on the
    /// handoff still having started at `observed_started_at`.
    async fn end_handoff(
        &self,
        id: Uuid,
        observed_started_at: DateTime<Utc>,
        status: ConversationStatus,
    ) -> Result<bool, DatabaseError>;

    async fn list_handoff_conversations(&self) -> Result<Vec<Conversation>, DatabaseError>;

    // ── Alerts ──────────────────────────────────────────────────────

    async fn insert_alert(
        &self,
        kind: AlertKind,
        participant_id: &str,
        detail: &str,
        now: DateTime<Utc>,
    ) -> Result<Uuid, DatabaseError>;

    /// Most recent alerts first.
    async fn list_alerts(
        &self,
        unresolved_only: bool,
        limit: usize,
    ) -> Result<Vec<Alert>, DatabaseError>;

    async fn resolve_alert(&self, id: Uuid) -> Result<bool, DatabaseError>;

    // ── Settings ────────────────────────────────────────────────────

    async fn get_setting(&self, key: &str) -> Result<Option<serde_json::Value>, DatabaseError>;

    async fn set_setting(&self, key: &str, value: &serde_json::Value)
    -> Result<(), DatabaseError>;

    async fn delete_setting(&self, key: &str) -> Result<bool, DatabaseError>;
}
