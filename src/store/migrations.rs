//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::StoreError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "initial_schema",
    sql: r#"
            CREATE TABLE IF NOT EXISTS polling_runs (
                id TEXT PRIMARY KEY,
                provider TEXT NOT NULL,
                mailbox TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'running',
                emails_found INTEGER NOT NULL DEFAULT 0,
                emails_processed INTEGER NOT NULL DEFAULT 0,
                emails_failed INTEGER NOT NULL DEFAULT 0,
                error TEXT,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                duration_ms INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_polling_runs_started ON polling_runs(started_at);

            CREATE TABLE IF NOT EXISTS processed_emails (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL REFERENCES polling_runs(id) ON DELETE CASCADE,
                message_id TEXT NOT NULL,
                sender TEXT NOT NULL,
                subject TEXT NOT NULL DEFAULT '',
                received_at TEXT NOT NULL,
                rule_id TEXT,
                template_id TEXT,
                attachment_count INTEGER NOT NULL DEFAULT 0,
                attachment_names TEXT NOT NULL DEFAULT '[]',
                page_counts TEXT NOT NULL DEFAULT '[]',
                status TEXT NOT NULL,
                error TEXT,
                sequence_id INTEGER,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_processed_emails_message ON processed_emails(message_id);
            CREATE INDEX IF NOT EXISTS idx_processed_emails_run ON processed_emails(run_id);

            CREATE TABLE IF NOT EXISTS extractions (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                message_id TEXT NOT NULL,
                template_id TEXT NOT NULL,
                filename TEXT NOT NULL,
                page_count INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'pending',
                payload TEXT,
                delivery_reference TEXT,
                error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_extractions_run ON extractions(run_id);
            CREATE INDEX IF NOT EXISTS idx_extractions_status ON extractions(status);

            CREATE TABLE IF NOT EXISTS templates (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                format TEXT NOT NULL,
                body TEXT NOT NULL,
                field_mappings TEXT NOT NULL DEFAULT '[]',
                array_splits TEXT NOT NULL DEFAULT '[]',
                array_entries TEXT NOT NULL DEFAULT '[]',
                delivery TEXT NOT NULL,
                partner_route TEXT,
                sequence_field TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS processing_rules (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL DEFAULT '',
                sender_pattern TEXT NOT NULL DEFAULT '',
                subject_pattern TEXT NOT NULL DEFAULT '',
                priority INTEGER NOT NULL DEFAULT 0,
                enabled INTEGER NOT NULL DEFAULT 1,
                template_id TEXT NOT NULL REFERENCES templates(id),
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_processing_rules_priority ON processing_rules(priority);

            CREATE TABLE IF NOT EXISTS mail_settings (
                mailbox TEXT PRIMARY KEY,
                enabled INTEGER NOT NULL DEFAULT 1,
                provider TEXT NOT NULL,
                tenant_id TEXT,
                client_id TEXT NOT NULL,
                client_secret TEXT NOT NULL,
                refresh_token TEXT,
                poll_interval_minutes INTEGER NOT NULL DEFAULT 5,
                check_all_messages INTEGER NOT NULL DEFAULT 0,
                last_check TEXT,
                success_action TEXT NOT NULL DEFAULT 'mark_read',
                success_folder TEXT,
                failure_action TEXT NOT NULL DEFAULT 'none',
                failure_folder TEXT,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS app_settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS sequence_counters (
                name TEXT PRIMARY KEY,
                value INTEGER NOT NULL DEFAULT 0
            );
        "#,
}];

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist.
pub async fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| StoreError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                StoreError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    tracing::info!(
        version = get_current_version(conn).await?,
        "Database migrations complete"
    );
    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, StoreError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| StoreError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| StoreError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => {
            let version: i64 = row.get(0).map_err(|e| {
                StoreError::Migration(format!("Failed to parse migration version: {e}"))
            })?;
            Ok(version)
        }
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| StoreError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}
