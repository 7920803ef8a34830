//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. A single connection is
//! shared behind an async mutex so `complete` can run its transaction
//! without other statements interleaving into it.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::to_chrono;
use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::model::{
    Alert, AlertKind, BufferEntry, Conversation, ConversationStatus, LockGrant, NewMessage,
    SenderRole, StoredMessage,
};
use crate::store::traits::Database;

/// libSQL database backend.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Mutex<Connection>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn: Mutex::new(conn),
        };
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn: Mutex::new(conn),
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    async fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().await
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format: fixed-width RFC 3339 in UTC, so lexical order in
/// SQL comparisons matches chronological order.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

fn parse_uuid(s: &str) -> Uuid {
    Uuid::parse_str(s).unwrap_or_else(|_| Uuid::nil())
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

const MESSAGE_COLUMNS: &str =
    "id, participant_id, conversation_id, sender_role, body, external_id, processed, created_at";

const BUFFER_COLUMNS: &str = "participant_id, last_activity_at, window_expires_at, in_progress, lock_owner, lock_acquired_at, retry_count, generation";

const CONVERSATION_COLUMNS: &str =
    "id, participant_id, handoff_active, handoff_started_at, status, last_activity_at, created_at";

const ALERT_COLUMNS: &str = "id, kind, participant_id, detail, created_at, resolved";

/// Map a libsql Row to a StoredMessage (column order: MESSAGE_COLUMNS).
fn row_to_message(row: &libsql::Row) -> Result<StoredMessage, libsql::Error> {
    let id_str: String = row.get(0)?;
    let conversation_str: String = row.get(2)?;
    let role_str: String = row.get(3)?;
    let created_str: String = row.get(7)?;

    Ok(StoredMessage {
        id: parse_uuid(&id_str),
        participant_id: row.get(1)?,
        conversation_id: parse_uuid(&conversation_str),
        sender_role: role_str.parse().unwrap_or(SenderRole::Customer),
        body: row.get(4)?,
        external_id: row.get(5).ok(),
        processed: row.get::<i64>(6)? != 0,
        created_at: parse_datetime(&created_str),
    })
}

/// Map a libsql Row to a BufferEntry (column order: BUFFER_COLUMNS).
fn row_to_buffer(row: &libsql::Row) -> Result<BufferEntry, libsql::Error> {
    let last_activity_str: String = row.get(1)?;
    let expires_str: String = row.get(2)?;
    let acquired_str: Option<String> = row.get(5).ok();

    Ok(BufferEntry {
        participant_id: row.get(0)?,
        last_activity_at: parse_datetime(&last_activity_str),
        window_expires_at: parse_datetime(&expires_str),
        in_progress: row.get::<i64>(3)? != 0,
        lock_owner: row.get(4).ok(),
        lock_acquired_at: parse_optional_datetime(&acquired_str),
        retry_count: row.get::<i64>(6)?.max(0) as u32,
        generation: row.get(7)?,
    })
}

/// Map a libsql Row to a Conversation (column order: CONVERSATION_COLUMNS).
fn row_to_conversation(row: &libsql::Row) -> Result<Conversation, libsql::Error> {
    let id_str: String = row.get(0)?;
    let started_str: Option<String> = row.get(3).ok();
    let status_str: String = row.get(4)?;
    let last_activity_str: String = row.get(5)?;
    let created_str: String = row.get(6)?;

    Ok(Conversation {
        id: parse_uuid(&id_str),
        participant_id: row.get(1)?,
        handoff_active: row.get::<i64>(2)? != 0,
        handoff_started_at: parse_optional_datetime(&started_str),
        status: status_str.parse().unwrap_or(ConversationStatus::Active),
        last_activity_at: parse_datetime(&last_activity_str),
        created_at: parse_datetime(&created_str),
    })
}

/// Map a libsql Row to an Alert (column order: ALERT_COLUMNS).
fn row_to_alert(row: &libsql::Row) -> Result<Alert, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Query(format!("alert row parse: {e}"));
    let id_str: String = row.get(0).map_err(get_err)?;
    let kind_str: String = row.get(1).map_err(get_err)?;
    let created_str: String = row.get(4).map_err(get_err)?;

    Ok(Alert {
        id: parse_uuid(&id_str),
        kind: kind_str.parse().map_err(DatabaseError::Serialization)?,
        participant_id: row.get(2).map_err(get_err)?,
        detail: row.get(3).map_err(get_err)?,
        created_at: parse_datetime(&created_str),
        resolved: row.get::<i64>(5).map_err(get_err)? != 0,
    })
}

/// Drain a row stream through `map`. A stream or row error fails the whole
/// read so callers never act on a partial result.
async fn collect_rows<T>(
    mut rows: libsql::Rows,
    map: impl Fn(&libsql::Row) -> Result<T, libsql::Error>,
    what: &str,
) -> Result<Vec<T>, DatabaseError> {
    let mut out = Vec::new();
    while let Some(row) = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Query(format!("{what} rows: {e}")))?
    {
        let item = map(&row).map_err(|e| DatabaseError::Query(format!("{what} row parse: {e}")))?;
        out.push(item);
    }
    Ok(out)
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        let conn = self.conn().await;
        migrations::run_migrations(&conn).await
    }

    // ── Messages ────────────────────────────────────────────────────

    async fn insert_message(
        &self,
        message: &NewMessage<'_>,
        now: DateTime<Utc>,
    ) -> Result<Option<StoredMessage>, DatabaseError> {
        let id = Uuid::new_v4();
        let conn = self.conn().await;
        // The UNIQUE constraint on external_id is the dedup guard.
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO inbound_messages (id, participant_id, conversation_id,
                    sender_role, body, external_id, processed, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    id.to_string(),
                    message.participant_id,
                    message.conversation_id.to_string(),
                    message.sender_role.as_str(),
                    message.body,
                    opt_text(message.external_id),
                    message.processed as i64,
                    ts(now),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_message: {e}")))?;

        if inserted == 0 {
            debug!(
                external_id = message.external_id.unwrap_or(""),
                "Duplicate message ignored"
            );
            return Ok(None);
        }

        debug!(id = %id, participant = message.participant_id, "Message inserted into DB");
        Ok(Some(StoredMessage {
            id,
            participant_id: message.participant_id.to_string(),
            conversation_id: message.conversation_id,
            sender_role: message.sender_role,
            body: message.body.to_string(),
            external_id: message.external_id.map(str::to_string),
            processed: message.processed,
            created_at: parse_datetime(&ts(now)),
        }))
    }

    async fn get_message_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<StoredMessage>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                &format!("SELECT {MESSAGE_COLUMNS} FROM inbound_messages WHERE external_id = ?1"),
                params![external_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_message_by_external_id: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let msg = row_to_message(&row)
                    .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
                Ok(Some(msg))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!(
                "get_message_by_external_id: {e}"
            ))),
        }
    }

    async fn list_unprocessed_messages(
        &self,
        participant_id: &str,
    ) -> Result<Vec<StoredMessage>, DatabaseError> {
        let conn = self.conn().await;
        let rows = conn
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM inbound_messages
                     WHERE participant_id = ?1 AND processed = 0
                     ORDER BY created_at ASC, rowid ASC"
                ),
                params![participant_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_unprocessed_messages: {e}")))?;

        collect_rows(rows, row_to_message, "message").await
    }

    async fn has_human_agent_message_since(
        &self,
        conversation_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                "SELECT EXISTS (SELECT 1 FROM inbound_messages
                    WHERE conversation_id = ?1 AND sender_role = 'human_agent' AND created_at >= ?2)",
                params![conversation_id.to_string(), ts(since)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("has_human_agent_message_since: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(0) != 0),
            Ok(None) => Ok(false),
            Err(e) => Err(DatabaseError::Query(format!(
                "has_human_agent_message_since: {e}"
            ))),
        }
    }

    // ── Buffer ──────────────────────────────────────────────────────

    async fn extend_buffer(
        &self,
        participant_id: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let expires = now + to_chrono(window);
        let conn = self.conn().await;
        let count = conn
            .execute(
                "INSERT INTO buffer_entries (participant_id, last_activity_at, window_expires_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT (participant_id) DO UPDATE
                    SET last_activity_at = excluded.last_activity_at,
                        window_expires_at = excluded.window_expires_at
                    WHERE buffer_entries.in_progress = 0",
                params![participant_id, ts(now), ts(expires)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("extend_buffer: {e}")))?;

        Ok(count > 0)
    }

    async fn get_buffer(
        &self,
        participant_id: &str,
    ) -> Result<Option<BufferEntry>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                &format!("SELECT {BUFFER_COLUMNS} FROM buffer_entries WHERE participant_id = ?1"),
                params![participant_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_buffer: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(
                row_to_buffer(&row).map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?,
            )),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_buffer: {e}"))),
        }
    }

    async fn list_expired_buffers(&self, now: DateTime<Utc>) -> Result<Vec<String>, DatabaseError> {
        let conn = self.conn().await;
        let rows = conn
            .query(
                "SELECT participant_id FROM buffer_entries
                 WHERE in_progress = 0 AND window_expires_at <= ?1
                 ORDER BY window_expires_at ASC",
                params![ts(now)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_expired_buffers: {e}")))?;

        collect_rows(rows, |row| row.get::<String>(0), "buffer").await
    }

    async fn expire_window(
        &self,
        participant_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn().await;
        let count = conn
            .execute(
                "UPDATE buffer_entries SET window_expires_at = ?2
                 WHERE participant_id = ?1 AND in_progress = 0 AND window_expires_at > ?2",
                params![participant_id, ts(now)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("expire_window: {e}")))?;
        Ok(count > 0)
    }

    async fn acquire(
        &self,
        participant_id: &str,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<LockGrant>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                "UPDATE buffer_entries
                 SET in_progress = 1, lock_owner = ?2, lock_acquired_at = ?3,
                     generation = generation + 1
                 WHERE participant_id = ?1 AND in_progress = 0 AND window_expires_at <= ?3
                 RETURNING generation, retry_count",
                params![participant_id, token, ts(now)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("acquire: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let generation: i64 = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("acquire row parse: {e}")))?;
                let retry_count = row.get::<i64>(1).unwrap_or(0).max(0) as u32;
                debug!(participant = participant_id, token, generation, "Lock acquired");
                Ok(Some(LockGrant {
                    participant_id: participant_id.to_string(),
                    token: token.to_string(),
                    generation,
                    acquired_at: now,
                    retry_count,
                }))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("acquire: {e}"))),
        }
    }

    async fn complete(
        &self,
        grant: &LockGrant,
        message_ids: &[Uuid],
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn().await;
        let tx = conn
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("complete begin: {e}")))?;

        let deleted = tx
            .execute(
                "DELETE FROM buffer_entries
                 WHERE participant_id = ?1 AND in_progress = 1 AND lock_owner = ?2 AND generation = ?3",
                params![
                    grant.participant_id.as_str(),
                    grant.token.as_str(),
                    grant.generation
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("complete delete: {e}")))?;

        if deleted == 0 {
            tx.rollback()
                .await
                .map_err(|e| DatabaseError::Query(format!("complete rollback: {e}")))?;
            return Ok(false);
        }

        for id in message_ids {
            tx.execute(
                "UPDATE inbound_messages SET processed = 1 WHERE id = ?1 AND participant_id = ?2",
                params![id.to_string(), grant.participant_id.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("complete mark processed: {e}")))?;
        }

        // Messages that landed while the lock was held were never in this
        // batch; give them a buffer that is already due.
        let mut rows = tx
            .query(
                "SELECT COUNT(*) FROM inbound_messages WHERE participant_id = ?1 AND processed = 0",
                params![grant.participant_id.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("complete leftover check: {e}")))?;
        let leftover = match rows.next().await {
            Ok(Some(row)) => row.get::<i64>(0).unwrap_or(0),
            _ => 0,
        };
        drop(rows);

        if leftover > 0 {
            tx.execute(
                "INSERT INTO buffer_entries (participant_id, last_activity_at, window_expires_at, generation)
                 VALUES (?1, ?2, ?2, ?3)",
                params![grant.participant_id.as_str(), ts(now), grant.generation],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("complete requeue: {e}")))?;
        }

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("complete commit: {e}")))?;

        debug!(
            participant = %grant.participant_id,
            generation = grant.generation,
            count = message_ids.len(),
            leftover,
            "Buffer completed"
        );
        Ok(true)
    }

    async fn release(&self, grant: &LockGrant, now: DateTime<Utc>) -> Result<bool, DatabaseError> {
        let conn = self.conn().await;
        let count = conn
            .execute(
                "UPDATE buffer_entries
                 SET in_progress = 0, lock_owner = NULL, lock_acquired_at = NULL,
                     window_expires_at = ?4, retry_count = retry_count + 1
                 WHERE participant_id = ?1 AND in_progress = 1 AND lock_owner = ?2 AND generation = ?3",
                params![
                    grant.participant_id.as_str(),
                    grant.token.as_str(),
                    grant.generation,
                    ts(now)
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("release: {e}")))?;
        Ok(count > 0)
    }

    async fn list_stale_locks(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<BufferEntry>, DatabaseError> {
        let conn = self.conn().await;
        let rows = conn
            .query(
                &format!(
                    "SELECT {BUFFER_COLUMNS} FROM buffer_entries
                     WHERE in_progress = 1 AND lock_acquired_at < ?1
                     ORDER BY lock_acquired_at ASC"
                ),
                params![ts(cutoff)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_stale_locks: {e}")))?;

        collect_rows(rows, row_to_buffer, "buffer").await
    }

    async fn reclaim_lock(
        &self,
        participant_id: &str,
        observed_owner: &str,
        observed_generation: i64,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn().await;
        let count = conn
            .execute(
                "UPDATE buffer_entries
                 SET in_progress = 0, lock_owner = NULL, lock_acquired_at = NULL,
                     window_expires_at = ?5, retry_count = retry_count + 1
                 WHERE participant_id = ?1 AND in_progress = 1 AND lock_owner = ?2
                   AND generation = ?3 AND lock_acquired_at < ?4",
                params![
                    participant_id,
                    observed_owner,
                    observed_generation,
                    ts(cutoff),
                    ts(now)
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("reclaim_lock: {e}")))?;
        Ok(count > 0)
    }

    // ── Conversations ───────────────────────────────────────────────

    async fn ensure_active_conversation(
        &self,
        participant_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Conversation, DatabaseError> {
        let conn = self.conn().await;
        // The partial unique index turns this into a no-op when an open
        // conversation already exists.
        conn.execute(
            "INSERT OR IGNORE INTO conversations (id, participant_id, status, last_activity_at, created_at)
             VALUES (?1, ?2, 'active', ?3, ?3)",
            params![Uuid::new_v4().to_string(), participant_id, ts(now)],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("ensure_active_conversation: {e}")))?;

        let mut rows = conn
            .query(
                &format!(
                    "SELECT {CONVERSATION_COLUMNS} FROM conversations
                     WHERE participant_id = ?1 AND status IN ('active', 'awaiting_agent')"
                ),
                params![participant_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("ensure_active_conversation: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_conversation(&row)
                .map_err(|e| DatabaseError::Query(format!("row parse: {e}"))),
            Ok(None) => Err(DatabaseError::NotFound {
                entity: "conversation".into(),
                id: participant_id.to_string(),
            }),
            Err(e) => Err(DatabaseError::Query(format!(
                "ensure_active_conversation: {e}"
            ))),
        }
    }

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_conversation: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(
                row_to_conversation(&row)
                    .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?,
            )),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_conversation: {e}"))),
        }
    }

    async fn touch_conversation(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), DatabaseError> {
        let conn = self.conn().await;
        conn.execute(
            "UPDATE conversations SET last_activity_at = MAX(last_activity_at, ?2) WHERE id = ?1",
            params![id.to_string(), ts(now)],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("touch_conversation: {e}")))?;
        Ok(())
    }

    async fn activate_handoff(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, DatabaseError> {
        let conn = self.conn().await;
        let count = conn
            .execute(
                "UPDATE conversations
                 SET handoff_active = 1, handoff_started_at = ?2, status = 'awaiting_agent'
                 WHERE id = ?1 AND handoff_active = 0 AND status = 'active'",
                params![id.to_string(), ts(now)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("activate_handoff: {e}")))?;
        Ok(count > 0)
    }

    async fn end_handoff(
        &self,
        id: Uuid,
        observed_started_at: DateTime<Utc>,
        status: ConversationStatus,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn().await;
        let count = conn
            .execute(
                "UPDATE conversations
                 SET handoff_active = 0, handoff_started_at = NULL, status = ?3
                 WHERE id = ?1 AND handoff_active = 1 AND handoff_started_at = ?2",
                params![id.to_string(), ts(observed_started_at), status.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("end_handoff: {e}")))?;
        Ok(count > 0)
    }

    async fn list_handoff_conversations(&self) -> Result<Vec<Conversation>, DatabaseError> {
        let conn = self.conn().await;
        let rows = conn
            .query(
                &format!(
                    "SELECT {CONVERSATION_COLUMNS} FROM conversations
                     WHERE handoff_active = 1 ORDER BY handoff_started_at ASC"
                ),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_handoff_conversations: {e}")))?;

        collect_rows(rows, row_to_conversation, "conversation").await
    }

    // ── Alerts ──────────────────────────────────────────────────────

    async fn insert_alert(
        &self,
        kind: AlertKind,
        participant_id: &str,
        detail: &str,
        now: DateTime<Utc>,
    ) -> Result<Uuid, DatabaseError> {
        let id = Uuid::new_v4();
        let conn = self.conn().await;
        conn.execute(
            "INSERT INTO alerts (id, kind, participant_id, detail, created_at, resolved)
             VALUES (?1, ?2, ?3, ?4, ?5, 0)",
            params![id.to_string(), kind.as_str(), participant_id, detail, ts(now)],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("insert_alert: {e}")))?;
        Ok(id)
    }

    async fn list_alerts(
        &self,
        unresolved_only: bool,
        limit: usize,
    ) -> Result<Vec<Alert>, DatabaseError> {
        let conn = self.conn().await;
        let filter = if unresolved_only {
            "WHERE resolved = 0"
        } else {
            ""
        };
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {ALERT_COLUMNS} FROM alerts {filter}
                     ORDER BY created_at DESC, rowid DESC LIMIT ?1"
                ),
                params![limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_alerts: {e}")))?;

        let mut alerts = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_alerts rows: {e}")))?
        {
            match row_to_alert(&row) {
                Ok(alert) => alerts.push(alert),
                Err(e) => warn!("Skipping alert row: {e}"),
            }
        }
        Ok(alerts)
    }

    async fn resolve_alert(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let conn = self.conn().await;
        let count = conn
            .execute(
                "UPDATE alerts SET resolved = 1 WHERE id = ?1 AND resolved = 0",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("resolve_alert: {e}")))?;
        Ok(count > 0)
    }

    // ── Settings ────────────────────────────────────────────────────

    async fn get_setting(&self, key: &str) -> Result<Option<serde_json::Value>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query("SELECT value FROM settings WHERE key = ?1", params![key])
            .await
            .map_err(|e| DatabaseError::Query(format!("get_setting: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let value_str: String = row.get(0).unwrap_or_else(|_| "null".to_string());
                let value: serde_json::Value =
                    serde_json::from_str(&value_str).unwrap_or(serde_json::Value::Null);
                Ok(Some(value))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_setting: {e}"))),
        }
    }

    async fn set_setting(
        &self,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<(), DatabaseError> {
        let value_str = serde_json::to_string(value)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let conn = self.conn().await;
        conn.execute(
            "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT (key) DO UPDATE SET value = ?2, updated_at = ?3",
            params![key, value_str, ts(Utc::now())],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("set_setting: {e}")))?;
        Ok(())
    }

    async fn delete_setting(&self, key: &str) -> Result<bool, DatabaseError> {
        let conn = self.conn().await;
        let count = conn
            .execute("DELETE FROM settings WHERE key = ?1", params![key])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_setting: {e}")))?;
        Ok(count > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::TimeZone;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap()
    }

    fn secs(n: i64) -> chrono::Duration {
        chrono::Duration::seconds(n)
    }

    const WINDOW: Duration = Duration::from_secs(5);

    async fn customer_message(db: &LibSqlBackend, participant: &str, body: &str, at: DateTime<Utc>) -> StoredMessage {
        let conv = db.ensure_active_conversation(participant, at).await.unwrap();
        db.insert_message(
            &NewMessage {
                participant_id: participant,
                conversation_id: conv.id,
                sender_role: SenderRole::Customer,
                body,
                external_id: None,
                processed: false,
            },
            at,
        )
        .await
        .unwrap()
        .unwrap()
    }

    // ── Message tests ───────────────────────────────────────────────

    #[tokio::test]
    async fn dedup_by_external_id() {
        let db = test_db().await;
        let conv = db.ensure_active_conversation("p1", t0()).await.unwrap();
        let msg = NewMessage {
            participant_id: "p1",
            conversation_id: conv.id,
            sender_role: SenderRole::Customer,
            body: "hello",
            external_id: Some("wamid.1"),
            processed: false,
        };

        let first = db.insert_message(&msg, t0()).await.unwrap();
        assert!(first.is_some());
        for _ in 0..3 {
            assert!(db.insert_message(&msg, t0()).await.unwrap().is_none());
        }

        let loaded = db.get_message_by_external_id("wamid.1").await.unwrap().unwrap();
        assert_eq!(loaded.id, first.unwrap().id);
        assert_eq!(db.list_unprocessed_messages("p1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn messages_without_external_id_are_not_deduped() {
        let db = test_db().await;
        customer_message(&db, "p1", "a", t0()).await;
        customer_message(&db, "p1", "a", t0()).await;
        assert_eq!(db.list_unprocessed_messages("p1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unprocessed_messages_are_oldest_first() {
        let db = test_db().await;
        customer_message(&db, "p1", "second", t0() + secs(2)).await;
        customer_message(&db, "p1", "first", t0() + secs(1)).await;
        customer_message(&db, "p1", "third", t0() + secs(3)).await;
        customer_message(&db, "p2", "other", t0()).await;

        let bodies: Vec<String> = db
            .list_unprocessed_messages("p1")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.body)
            .collect();
        assert_eq!(bodies, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn same_timestamp_keeps_insertion_order() {
        let db = test_db().await;
        for body in ["a", "b", "c"] {
            customer_message(&db, "p1", body, t0()).await;
        }
        let bodies: Vec<String> = db
            .list_unprocessed_messages("p1")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.body)
            .collect();
        assert_eq!(bodies, vec!["a", "b", "c"]);
    }

    // ── Buffer / lock tests ─────────────────────────────────────────

    #[tokio::test]
    async fn acquire_requires_expired_window() {
        let db = test_db().await;
        db.extend_buffer("p1", WINDOW, t0()).await.unwrap();

        assert!(db.acquire("p1", "early", t0() + secs(4)).await.unwrap().is_none());
        let grant = db.acquire("p1", "tok", t0() + secs(5)).await.unwrap().unwrap();
        assert_eq!(grant.generation, 1);

        let entry = db.get_buffer("p1").await.unwrap().unwrap();
        assert!(entry.in_progress);
        assert_eq!(entry.lock_owner.as_deref(), Some("tok"));
        assert_eq!(entry.lock_acquired_at, Some(t0() + secs(5)));
    }

    #[tokio::test]
    async fn acquire_is_mutually_exclusive() {
        let db = test_db().await;
        db.extend_buffer("p1", WINDOW, t0()).await.unwrap();
        let now = t0() + secs(10);

        assert!(db.acquire("p1", "a", now).await.unwrap().is_some());
        assert!(db.acquire("p1", "b", now).await.unwrap().is_none());
        assert!(db.acquire("p1", "a", now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_acquires_grant_exactly_one() {
        let db = Arc::new(test_db().await);
        db.extend_buffer("p1", WINDOW, t0()).await.unwrap();
        let now = t0() + secs(10);

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let db = Arc::clone(&db);
                tokio::spawn(async move { db.acquire("p1", &format!("tok-{i}"), now).await })
            })
            .collect();

        let mut granted = 0;
        for h in handles {
            if h.await.unwrap().unwrap().is_some() {
                granted += 1;
            }
        }
        assert_eq!(granted, 1);
    }

    #[tokio::test]
    async fn extend_does_not_touch_claimed_buffer() {
        let db = test_db().await;
        db.extend_buffer("p1", WINDOW, t0()).await.unwrap();
        db.acquire("p1", "tok", t0() + secs(6)).await.unwrap().unwrap();
        let before = db.get_buffer("p1").await.unwrap().unwrap();

        let written = db.extend_buffer("p1", WINDOW, t0() + secs(7)).await.unwrap();
        assert!(!written);
        assert_eq!(db.get_buffer("p1").await.unwrap().unwrap(), before);
    }

    #[tokio::test]
    async fn extend_slides_unclaimed_window() {
        let db = test_db().await;
        db.extend_buffer("p1", WINDOW, t0()).await.unwrap();
        db.extend_buffer("p1", WINDOW, t0() + secs(3)).await.unwrap();

        let entry = db.get_buffer("p1").await.unwrap().unwrap();
        assert_eq!(entry.window_expires_at, t0() + secs(8));
        assert_eq!(entry.last_activity_at, t0() + secs(3));
        assert!(!entry.in_progress);
    }

    #[tokio::test]
    async fn complete_marks_processed_and_deletes() {
        let db = test_db().await;
        let m1 = customer_message(&db, "p1", "one", t0()).await;
        let m2 = customer_message(&db, "p1", "two", t0()).await;
        db.extend_buffer("p1", WINDOW, t0()).await.unwrap();

        let grant = db.acquire("p1", "tok", t0() + secs(5)).await.unwrap().unwrap();
        assert!(db.complete(&grant, &[m1.id, m2.id], t0() + secs(6)).await.unwrap());

        assert!(db.get_buffer("p1").await.unwrap().is_none());
        assert!(db.list_unprocessed_messages("p1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn complete_with_wrong_token_is_rejected() {
        let db = test_db().await;
        let m1 = customer_message(&db, "p1", "one", t0()).await;
        db.extend_buffer("p1", WINDOW, t0()).await.unwrap();
        let mut grant = db.acquire("p1", "tok", t0() + secs(5)).await.unwrap().unwrap();
        grant.token = "imposter".into();

        assert!(!db.complete(&grant, &[m1.id], t0() + secs(6)).await.unwrap());
        assert!(db.get_buffer("p1").await.unwrap().unwrap().in_progress);
        assert_eq!(db.list_unprocessed_messages("p1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn complete_requeues_messages_that_arrived_mid_claim() {
        let db = test_db().await;
        let m1 = customer_message(&db, "p1", "one", t0()).await;
        db.extend_buffer("p1", WINDOW, t0()).await.unwrap();
        let grant = db.acquire("p1", "tok", t0() + secs(5)).await.unwrap().unwrap();

        customer_message(&db, "p1", "late", t0() + secs(6)).await;
        db.extend_buffer("p1", WINDOW, t0() + secs(6)).await.unwrap();

        assert!(db.complete(&grant, &[m1.id], t0() + secs(7)).await.unwrap());
        let entry = db.get_buffer("p1").await.unwrap().unwrap();
        assert!(!entry.in_progress);
        assert_eq!(entry.window_expires_at, t0() + secs(7));
        assert_eq!(db.list_expired_buffers(t0() + secs(7)).await.unwrap(), vec!["p1"]);
    }

    #[tokio::test]
    async fn release_makes_buffer_immediately_eligible() {
        let db = test_db().await;
        db.extend_buffer("p1", WINDOW, t0()).await.unwrap();
        let grant = db.acquire("p1", "tok", t0() + secs(5)).await.unwrap().unwrap();

        assert!(db.release(&grant, t0() + secs(9)).await.unwrap());
        let entry = db.get_buffer("p1").await.unwrap().unwrap();
        assert!(!entry.in_progress);
        assert!(entry.lock_owner.is_none());
        assert!(entry.lock_acquired_at.is_none());
        assert_eq!(entry.window_expires_at, t0() + secs(9));
        assert_eq!(entry.retry_count, 1);

        // A second release with the same grant is a no-op
        assert!(!db.release(&grant, t0() + secs(9)).await.unwrap());
    }

    #[tokio::test]
    async fn stale_generation_cannot_complete_after_reclaim() {
        let db = test_db().await;
        let m1 = customer_message(&db, "p1", "one", t0()).await;
        db.extend_buffer("p1", WINDOW, t0()).await.unwrap();
        let stale = db.acquire("p1", "worker-a", t0() + secs(5)).await.unwrap().unwrap();

        let cutoff = t0() + secs(400);
        let reclaimed = db
            .reclaim_lock("p1", "worker-a", stale.generation, cutoff, t0() + secs(700))
            .await
            .unwrap();
        assert!(reclaimed);

        let fresh = db.acquire("p1", "worker-b", t0() + secs(701)).await.unwrap().unwrap();
        assert_eq!(fresh.generation, stale.generation + 1);

        assert!(!db.complete(&stale, &[m1.id], t0() + secs(702)).await.unwrap());
        assert!(!db.release(&stale, t0() + secs(702)).await.unwrap());
        assert!(db.complete(&fresh, &[m1.id], t0() + secs(702)).await.unwrap());
    }

    #[tokio::test]
    async fn reclaim_ignores_changed_owner_and_fresh_locks() {
        let db = test_db().await;
        db.extend_buffer("p1", WINDOW, t0()).await.unwrap();
        let grant = db.acquire("p1", "tok", t0() + secs(5)).await.unwrap().unwrap();

        // Wrong observed owner
        assert!(
            !db.reclaim_lock("p1", "other", grant.generation, t0() + secs(400), t0() + secs(400))
                .await
                .unwrap()
        );
        // Lock newer than cutoff
        assert!(
            !db.reclaim_lock("p1", "tok", grant.generation, t0() + secs(1), t0() + secs(400))
                .await
                .unwrap()
        );
        assert!(db.get_buffer("p1").await.unwrap().unwrap().in_progress);
    }

    #[tokio::test]
    async fn list_stale_locks_uses_cutoff() {
        let db = test_db().await;
        db.extend_buffer("old", WINDOW, t0()).await.unwrap();
        db.extend_buffer("new", WINDOW, t0()).await.unwrap();
        db.acquire("old", "a", t0() + secs(5)).await.unwrap().unwrap();
        db.acquire("new", "b", t0() + secs(500)).await.unwrap().unwrap();

        let stale = db.list_stale_locks(t0() + secs(100)).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].participant_id, "old");
    }

    #[tokio::test]
    async fn expire_window_skips_claimed_buffers() {
        let db = test_db().await;
        db.extend_buffer("p1", Duration::from_secs(60), t0()).await.unwrap();
        assert!(db.expire_window("p1", t0() + secs(1)).await.unwrap());
        assert_eq!(db.list_expired_buffers(t0() + secs(1)).await.unwrap(), vec!["p1"]);

        db.acquire("p1", "tok", t0() + secs(1)).await.unwrap().unwrap();
        assert!(!db.expire_window("p1", t0() + secs(2)).await.unwrap());
    }

    // ── Conversation tests ──────────────────────────────────────────

    #[tokio::test]
    async fn ensure_active_conversation_is_idempotent() {
        let db = test_db().await;
        let a = db.ensure_active_conversation("p1", t0()).await.unwrap();
        let b = db.ensure_active_conversation("p1", t0() + secs(5)).await.unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.status, ConversationStatus::Active);
        assert!(!a.handoff_active);
    }

    #[tokio::test]
    async fn closed_conversation_is_replaced() {
        let db = test_db().await;
        let conv = db.ensure_active_conversation("p1", t0()).await.unwrap();
        assert!(db.activate_handoff(conv.id, t0()).await.unwrap());
        assert!(db.end_handoff(conv.id, t0(), ConversationStatus::Lost).await.unwrap());

        let next = db.ensure_active_conversation("p1", t0() + secs(1)).await.unwrap();
        assert_ne!(next.id, conv.id);
        let old = db.get_conversation(conv.id).await.unwrap().unwrap();
        assert_eq!(old.status, ConversationStatus::Lost);
    }

    #[tokio::test]
    async fn handoff_transitions_are_conditional() {
        let db = test_db().await;
        let conv = db.ensure_active_conversation("p1", t0()).await.unwrap();

        assert!(db.activate_handoff(conv.id, t0()).await.unwrap());
        assert!(!db.activate_handoff(conv.id, t0() + secs(1)).await.unwrap());

        let loaded = db.get_conversation(conv.id).await.unwrap().unwrap();
        assert!(loaded.handoff_active);
        assert_eq!(loaded.handoff_started_at, Some(t0()));
        assert_eq!(loaded.status, ConversationStatus::AwaitingAgent);
        assert_eq!(db.list_handoff_conversations().await.unwrap().len(), 1);

        // Wrong observed start time loses the race
        assert!(
            !db.end_handoff(conv.id, t0() + secs(1), ConversationStatus::Active)
                .await
                .unwrap()
        );
        assert!(db.end_handoff(conv.id, t0(), ConversationStatus::Active).await.unwrap());
        assert!(!db.end_handoff(conv.id, t0(), ConversationStatus::Active).await.unwrap());

        let loaded = db.get_conversation(conv.id).await.unwrap().unwrap();
        assert!(!loaded.handoff_active);
        assert!(loaded.handoff_started_at.is_none());
        assert_eq!(loaded.status, ConversationStatus::Active);
    }

    #[tokio::test]
    async fn touch_never_moves_backwards() {
        let db = test_db().await;
        let conv = db.ensure_active_conversation("p1", t0()).await.unwrap();
        db.touch_conversation(conv.id, t0() + secs(10)).await.unwrap();
        db.touch_conversation(conv.id, t0() + secs(5)).await.unwrap();
        let loaded = db.get_conversation(conv.id).await.unwrap().unwrap();
        assert_eq!(loaded.last_activity_at, t0() + secs(10));
    }

    #[tokio::test]
    async fn human_agent_message_detection() {
        let db = test_db().await;
        let conv = db.ensure_active_conversation("p1", t0()).await.unwrap();
        db.insert_message(
            &NewMessage {
                participant_id: "p1",
                conversation_id: conv.id,
                sender_role: SenderRole::HumanAgent,
                body: "on it",
                external_id: None,
                processed: true,
            },
            t0() + secs(10),
        )
        .await
        .unwrap();

        assert!(db.has_human_agent_message_since(conv.id, t0()).await.unwrap());
        assert!(db.has_human_agent_message_since(conv.id, t0() + secs(10)).await.unwrap());
        assert!(!db.has_human_agent_message_since(conv.id, t0() + secs(11)).await.unwrap());
    }

    // ── Alert / settings tests ──────────────────────────────────────

    #[tokio::test]
    async fn alerts_are_listed_and_resolved() {
        let db = test_db().await;
        let first = db
            .insert_alert(AlertKind::ProcessingFailed, "p1", "boom", t0())
            .await
            .unwrap();
        db.insert_alert(AlertKind::StuckLockReclaimed, "p2", "stale", t0() + secs(1))
            .await
            .unwrap();

        let all = db.list_alerts(false, 10).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].kind, AlertKind::StuckLockReclaimed);

        assert!(db.resolve_alert(first).await.unwrap());
        assert!(!db.resolve_alert(first).await.unwrap());
        let open = db.list_alerts(true, 10).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].participant_id, "p2");
    }

    #[tokio::test]
    async fn settings_crud() {
        let db = test_db().await;
        assert!(db.get_setting("buffer_window_secs").await.unwrap().is_none());

        db.set_setting("buffer_window_secs", &serde_json::json!(9)).await.unwrap();
        db.set_setting("buffer_window_secs", &serde_json::json!(12)).await.unwrap();
        assert_eq!(
            db.get_setting("buffer_window_secs").await.unwrap(),
            Some(serde_json::json!(12))
        );

        assert!(db.delete_setting("buffer_window_secs").await.unwrap());
        assert!(!db.delete_setting("buffer_window_secs").await.unwrap());
    }

    #[tokio::test]
    async fn open_local_creates_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let db_path = tmp.path().join("nested").join("dir").join("test.db");
        let db = LibSqlBackend::new_local(&db_path).await.unwrap();
        assert!(db_path.exists());
        drop(db);
    }

    #[tokio::test]
    async fn unreadable_message_row_fails_the_listing() {
        let db = test_db().await;
        customer_message(&db, "p1", "fine", t0()).await;
        // A body stored as a blob cannot be read back as text
        db.conn()
            .await
            .execute(
                "INSERT INTO inbound_messages (id, participant_id, conversation_id,
                    sender_role, body, processed, created_at)
                 VALUES (?1, 'p1', ?2, 'customer', X'00', 0, ?3)",
                params![
                    Uuid::new_v4().to_string(),
                    Uuid::new_v4().to_string(),
                    ts(t0() + secs(1))
                ],
            )
            .await
            .unwrap();

        let err = db.list_unprocessed_messages("p1").await.unwrap_err();
        assert!(matches!(err, DatabaseError::Query(_)));
    }

    #[test]
    fn timestamp_format_is_fixed_width() {
        let a = ts(t0());
        let b = ts(t0() + chrono::Duration::microseconds(1));
        assert_eq!(a.len(), b.len());
        assert!(a < b);
        assert_eq!(parse_datetime(&a), t0());
    }
}
