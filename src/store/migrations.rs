//! Schema steps for the libSQL store.
//!
//! Applied versions are recorded in `_migrations`; only newer steps run.

use libsql::Connection;

use crate::error::DatabaseError;

struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// Ordered schema steps. Append only.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "items_and_rules",
        sql: r#"
            CREATE TABLE IF NOT EXISTS items (
                id TEXT PRIMARY KEY,
                external_id TEXT NOT NULL UNIQUE,
                user_id TEXT NOT NULL,
                channel_id TEXT NOT NULL,
                sender TEXT NOT NULL,
                subject TEXT NOT NULL,
                body TEXT NOT NULL,
                thread_ref TEXT,
                received_at TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                category TEXT,
                label TEXT,
                error_reason TEXT,
                thread_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_items_status ON items(status);
            CREATE INDEX IF NOT EXISTS idx_items_thread_ref ON items(user_id, thread_ref);

            CREATE TABLE IF NOT EXISTS outbound_replies (
                id TEXT PRIMARY KEY,
                item_id TEXT NOT NULL REFERENCES items(id) ON DELETE CASCADE,
                recipient TEXT NOT NULL,
                subject TEXT NOT NULL,
                body TEXT NOT NULL,
                sent_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_outbound_item ON outbound_replies(item_id);

            CREATE TABLE IF NOT EXISTS categories (
                user_id TEXT NOT NULL,
                name TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (user_id, name)
            );

            CREATE TABLE IF NOT EXISTS priority_contacts (
                user_id TEXT NOT NULL,
                contact TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (user_id, contact)
            );

            CREATE TABLE IF NOT EXISTS message_embeddings (
                item_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                thread_ref TEXT,
                sender TEXT NOT NULL,
                subject TEXT NOT NULL,
                snippet TEXT NOT NULL,
                received_at TEXT NOT NULL,
                vector TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_embeddings_user ON message_embeddings(user_id, received_at);
        "#,
    },
    Migration {
        version: 2,
        name: "durable_workflows",
        sql: r#"
            CREATE TABLE IF NOT EXISTS workflow_instances (
                thread_id TEXT PRIMARY KEY,
                item_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                current_node TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'running',
                error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_instances_status ON workflow_instances(status);
            CREATE INDEX IF NOT EXISTS idx_instances_item ON workflow_instances(item_id);

            CREATE TABLE IF NOT EXISTS checkpoints (
                thread_id TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                node_name TEXT NOT NULL,
                schema_version INTEGER NOT NULL,
                state TEXT NOT NULL,
                written_at TEXT NOT NULL,
                UNIQUE (thread_id, sequence)
            );

            CREATE TABLE IF NOT EXISTS approval_mappings (
                item_id TEXT PRIMARY KEY,
                thread_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                message_handle TEXT NOT NULL,
                state_label TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_approval_thread ON approval_mappings(thread_id);

            CREATE TABLE IF NOT EXISTS approval_handles (
                message_handle TEXT PRIMARY KEY,
                item_id TEXT NOT NULL,
                thread_id TEXT NOT NULL,
                position INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_approval_handles_thread ON approval_handles(thread_id);

            CREATE TABLE IF NOT EXISTS pending_edits (
                user_id TEXT PRIMARY KEY,
                channel_id TEXT NOT NULL,
                item_id TEXT NOT NULL,
                thread_id TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_pending_edits_channel ON pending_edits(channel_id);
        "#,
    },
];

/// Bring the schema up to the latest version. Safe to call on every start.
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
    .map_err(|e| DatabaseError::Migration(format!("cannot create version table: {e}")))?;

    let applied = schema_version(conn).await?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > applied).collect();
    if pending.is_empty() {
        tracing::debug!(version = applied, "Schema up to date");
        return Ok(());
    }

    for step in pending {
        tracing::info!(version = step.version, name = step.name, "Applying schema step");
        conn.execute_batch(step.sql)
            .await
            .map_err(|e| DatabaseError::Migration(format!("step {} '{}': {e}", step.version, step.name)))?;
        mark_applied(conn, step).await?;
    }
    Ok(())
}

/// Highest applied version; 0 on a fresh database.
async fn schema_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("cannot read schema version: {e}")))?;
    let Some(row) = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("cannot read schema version: {e}")))?
    else {
        return Ok(0);
    };
    row.get::<i64>(0)
        .map_err(|e| DatabaseError::Migration(format!("bad schema version value: {e}")))
}

async fn mark_applied(conn: &Connection, step: &Migration) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![step.version, step.name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("cannot record step {}: {e}", step.version)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fresh() -> Connection {
        let db = libsql::Builder::new_local(":memory:").build().await.unwrap();
        db.connect().unwrap()
    }

    #[tokio::test]
    async fn creates_every_table() {
        let conn = fresh().await;
        run_migrations(&conn).await.unwrap();

        for table in &[
            "_migrations",
            "items",
            "outbound_replies",
            "categories",
            "priority_contacts",
            "message_embeddings",
            "workflow_instances",
            "checkpoints",
            "approval_mappings",
            "approval_handles",
            "pending_edits",
        ] {
            let mut rows = conn
                .query(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    libsql::params![*table],
                )
                .await
                .unwrap();
            let found: i64 = rows.next().await.unwrap().unwrap().get(0).unwrap();
            assert_eq!(found, 1, "missing table {table}");
        }
    }

    #[tokio::test]
    async fn rerun_is_a_no_op() {
        let conn = fresh().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();

        let version = schema_version(&conn).await.unwrap();
        assert_eq!(version, 2);
    }

    #[tokio::test]
    async fn checkpoint_sequence_is_unique_per_thread() {
        let conn = fresh().await;
        run_migrations(&conn).await.unwrap();

        conn.execute(
            "INSERT INTO checkpoints (thread_id, sequence, node_name, schema_version, state, written_at)
             VALUES ('t', 1, 'classify', 1, '{}', '2026-01-01T00:00:00Z')",
            (),
        )
        .await
        .unwrap();
        let dup = conn
            .execute(
                "INSERT INTO checkpoints (thread_id, sequence, node_name, schema_version, state, written_at)
                 VALUES ('t', 1, 'notify', 1, '{}', '2026-01-01T00:00:01Z')",
                (),
            )
            .await;
        assert!(dup.is_err());
    }
}
