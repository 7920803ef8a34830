//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "buffer_core",
        sql: r#"
            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                participant_id TEXT NOT NULL,
                handoff_active INTEGER NOT NULL DEFAULT 0,
                handoff_started_at TEXT,
                status TEXT NOT NULL DEFAULT 'active',
                last_activity_at TEXT NOT NULL,
                created_at TEXT NOT NULL,
                CHECK (handoff_active = 0 OR handoff_started_at IS NOT NULL)
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_conversations_open_participant
                ON conversations(participant_id) WHERE status IN ('active', 'awaiting_agent');
            CREATE INDEX IF NOT EXISTS idx_conversations_handoff ON conversations(handoff_active);

            CREATE TABLE IF NOT EXISTS inbound_messages (
                id TEXT PRIMARY KEY,
                participant_id TEXT NOT NULL,
                conversation_id TEXT NOT NULL,
                sender_role TEXT NOT NULL,
                body TEXT NOT NULL,
                external_id TEXT UNIQUE,
                processed INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_inbound_messages_pending
                ON inbound_messages(participant_id, processed, created_at);
            CREATE INDEX IF NOT EXISTS idx_inbound_messages_conversation
                ON inbound_messages(conversation_id, sender_role, created_at);

            CREATE TABLE IF NOT EXISTS buffer_entries (
                participant_id TEXT PRIMARY KEY,
                last_activity_at TEXT NOT NULL,
                window_expires_at TEXT NOT NULL,
                in_progress INTEGER NOT NULL DEFAULT 0,
                lock_owner TEXT,
                lock_acquired_at TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                generation INTEGER NOT NULL DEFAULT 0,
                CHECK (in_progress = 0 OR (lock_owner IS NOT NULL AND lock_acquired_at IS NOT NULL))
            );
            CREATE INDEX IF NOT EXISTS idx_buffer_entries_expiry
                ON buffer_entries(in_progress, window_expires_at);
        "#,
    },
    Migration {
        version: 2,
        name: "alerts_and_settings",
        sql: r#"
            CREATE TABLE IF NOT EXISTS alerts (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                participant_id TEXT NOT NULL,
                detail TEXT NOT NULL,
                created_at TEXT NOT NULL,
                resolved INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_alerts_resolved ON alerts(resolved, created_at);

            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
        "#,
    },
];

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    let version = get_current_version(conn).await?;
    tracing::debug!(version, "Database migrations complete");

    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => {
            let version: i64 = row.get(0).map_err(|e| {
                DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
            })?;
            Ok(version)
        }
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        db.connect().unwrap()
    }

    async fn table_exists(conn: &Connection, table: &str) -> bool {
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                libsql::params![table],
            )
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        row.get::<i64>(0).unwrap() == 1
    }

    #[tokio::test]
    async fn migrations_create_all_tables() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        for table in &[
            "conversations",
            "inbound_messages",
            "buffer_entries",
            "alerts",
            "settings",
            "_migrations",
        ] {
            assert!(table_exists(&conn, table).await, "Table '{}' should exist", table);
        }
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();

        let version = get_current_version(&conn).await.unwrap();
        assert_eq!(version, 2);
    }

    #[tokio::test]
    async fn buffer_lock_invariant_is_enforced() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        // in_progress without an owner violates the CHECK constraint
        let result = conn
            .execute(
                "INSERT INTO buffer_entries (participant_id, last_activity_at, window_expires_at, in_progress)
                 VALUES ('p1', '2026-01-01T00:00:00.000000Z', '2026-01-01T00:00:00.000000Z', 1)",
                (),
            )
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn one_open_conversation_per_participant() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        conn.execute(
            "INSERT INTO conversations (id, participant_id, status, last_activity_at, created_at)
             VALUES ('c1', 'p1', 'active', 'x', 'x')",
            (),
        )
        .await
        .unwrap();
        let dup = conn
            .execute(
                "INSERT INTO conversations (id, participant_id, status, last_activity_at, created_at)
                 VALUES ('c2', 'p1', 'awaiting_agent', 'x', 'x')",
                (),
            )
            .await;
        assert!(dup.is_err());

        // A closed conversation does not block a new open one
        conn.execute("UPDATE conversations SET status = 'lost' WHERE id = 'c1'", ())
            .await
            .unwrap();
        conn.execute(
            "INSERT INTO conversations (id, participant_id, status, last_activity_at, created_at)
             VALUES ('c3', 'p1', 'active', 'x', 'x')",
            (),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn version_tracking() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        let mut rows = conn
            .query("SELECT version, name FROM _migrations ORDER BY version", ())
            .await
            .unwrap();
        let row1 = rows.next().await.unwrap().unwrap();
        assert_eq!(row1.get::<i64>(0).unwrap(), 1);
        assert_eq!(row1.get::<String>(1).unwrap(), "buffer_core");

        let row2 = rows.next().await.unwrap().unwrap();
        assert_eq!(row2.get::<i64>(0).unwrap(), 2);
        assert_eq!(row2.get::<String>(1).unwrap(), "alerts_and_settings");
    }
}
