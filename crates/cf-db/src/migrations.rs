//! Embedded SQL migrations and runner.
//!
//! Migrations are stored as `&str` constants and executed in order.  A
//! `schema_migrations` table tracks which versions have been applied.

use cf_core::{Error, Result};
use rusqlite::Connection;

/// V1: initial schema -- batches, jobs, reference images.
const V1_INITIAL: &str = r#"
CREATE TABLE batches (
    id             TEXT PRIMARY KEY,
    name           TEXT NOT NULL,
    status         TEXT NOT NULL DEFAULT 'pending',
    total_jobs     INTEGER NOT NULL DEFAULT 0,
    completed_jobs INTEGER NOT NULL DEFAULT 0,
    failed_jobs    INTEGER NOT NULL DEFAULT 0,
    source_kind    TEXT,
    source_value   TEXT,
    created_at     TEXT NOT NULL,
    updated_at     TEXT NOT NULL,
    completed_at   TEXT
);

-- Jobs outlive their batch: deleting a batch only detaches its children.
CREATE TABLE jobs (
    id                 TEXT PRIMARY KEY,
    batch_id           TEXT REFERENCES batches(id) ON DELETE SET NULL,
    status             TEXT NOT NULL DEFAULT 'queued',
    steps              TEXT NOT NULL DEFAULT '[]',
    current_step       INTEGER NOT NULL DEFAULT 0,
    progress_label     TEXT,
    source_kind        TEXT NOT NULL,
    source_value       TEXT NOT NULL,
    output_url         TEXT,
    step_results       TEXT NOT NULL DEFAULT '[]',
    error              TEXT,
    pending_endpoint   TEXT,
    pending_request_id TEXT,
    pending_step_id    TEXT,
    created_at         TEXT NOT NULL,
    started_at         TEXT,
    updated_at         TEXT NOT NULL,
    completed_at       TEXT
);

CREATE TABLE reference_images (
    id         TEXT PRIMARY KEY,
    url        TEXT NOT NULL,
    label      TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX idx_jobs_batch ON jobs(batch_id);
CREATE INDEX idx_jobs_status ON jobs(status, created_at);
CREATE INDEX idx_batches_status ON batches(status, created_at);
"#;

/// Ordered list of `(version, sql)` pairs.
const MIGRATIONS: &[(i64, &str)] = &[(1, V1_INITIAL)];

/// Apply every migration that has not been recorded yet.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version    INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
    )
    .map_err(|e| Error::database(format!("Failed to create schema_migrations: {e}")))?;

    for &(version, sql) in MIGRATIONS {
        let already: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM schema_migrations WHERE version = ?1",
                [version],
                |row| row.get(0),
            )
            .map_err(|e| Error::database(e.to_string()))?;

        if already {
            continue;
        }

        let tx = conn
            .unchecked_transaction()
            .map_err(|e| Error::database(e.to_string()))?;

        tx.execute_batch(sql)
            .map_err(|e| Error::database(format!("Migration V{version} failed: {e}")))?;

        tx.execute(
            "INSERT INTO schema_migrations (version) VALUES (?1)",
            [version],
        )
        .map_err(|e| Error::database(e.to_string()))?;

        tx.commit().map_err(|e| Error::database(e.to_string()))?;

        tracing::info!(version, "Applied database migration");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        // second call is a no-op
        run_migrations(&conn).unwrap();

        let versions: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(versions, MIGRATIONS.len() as i64);
    }

    #[test]
    fn test_all_tables_created() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        for t in ["batches", "jobs", "reference_images", "schema_migrations"] {
            let exists: bool = conn
                .query_row(
                    "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name=?1",
                    [t],
                    |row| row.get(0),
                )
                .unwrap();
            assert!(exists, "table {t} should exist");
        }
    }
}
