//! Batch persistence and aggregate progress.

use cf_core::{BatchCounts, BatchId, BatchStatus, Error, PipelineStep, Result, SourceRef};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};

use super::jobs::{create_job, NewJob};
use super::now;
use crate::models::{Batch, Job};

const COLS: &str = "id, name, status, total_jobs, completed_jobs, failed_jobs,
    source_kind, source_value, created_at, updated_at, completed_at";

/// Partial update of a batch. `None` leaves the stored value untouched.
#[derive(Debug, Clone, Default)]
pub struct BatchUpdate {
    pub name: Option<String>,
    pub status: Option<BatchStatus>,
    pub source: Option<SourceRef>,
}

/// Create an empty batch in `pending`.
pub fn create_batch(conn: &Connection, name: &str, source: Option<&SourceRef>) -> Result<Batch> {
    let id = BatchId::new();
    let now = now();

    conn.execute(
        "INSERT INTO batches (id, name, status, source_kind, source_value, created_at, updated_at)
         VALUES (?1, ?2, 'pending', ?3, ?4, ?5, ?5)",
        params![
            id.to_string(),
            name,
            source.map(|s| s.kind()),
            source.map(|s| s.value()),
            &now
        ],
    )
    .map_err(|e| Error::database(e.to_string()))?;

    Ok(Batch {
        id,
        name: name.to_string(),
        status: BatchStatus::Pending,
        total_jobs: 0,
        completed_jobs: 0,
        failed_jobs: 0,
        source: source.cloned(),
        created_at: now.clone(),
        updated_at: now,
        completed_at: None,
    })
}

/// Create a batch and `count` child jobs sharing `source`, in one transaction.
pub fn create_batch_with_jobs(
    conn: &Connection,
    name: &str,
    steps: &[PipelineStep],
    source: &SourceRef,
    count: u32,
) -> Result<(Batch, Vec<Job>)> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| Error::database(e.to_string()))?;

    let mut batch = create_batch(&tx, name, Some(source))?;
    let new = NewJob {
        steps: steps.to_vec(),
        source: source.clone(),
        batch_id: Some(batch.id),
    };
    let jobs = (0..count)
        .map(|_| create_job(&tx, &new))
        .collect::<Result<Vec<_>>>()?;

    tx.execute(
        "UPDATE batches SET total_jobs = ?1 WHERE id = ?2",
        params![count, batch.id.to_string()],
    )
    .map_err(|e| Error::database(e.to_string()))?;
    tx.commit().map_err(|e| Error::database(e.to_string()))?;

    batch.total_jobs = count;
    Ok((batch, jobs))
}

/// Get a batch by ID.
pub fn get_batch(conn: &Connection, id: BatchId) -> Result<Option<Batch>> {
    let q = format!("SELECT {COLS} FROM batches WHERE id = ?1");
    conn.query_row(&q, [id.to_string()], Batch::from_row)
        .optional()
        .map_err(|e| Error::database(e.to_string()))
}

/// Merge `update` into the stored batch. A terminal status also stamps
/// `completed_at` if it is not set yet.
pub fn update_batch(conn: &Connection, id: BatchId, update: &BatchUpdate) -> Result<bool> {
    let now = now();
    let completed_at = update
        .status
        .filter(BatchStatus::is_terminal)
        .map(|_| now.clone());
    let n = conn
        .execute(
            "UPDATE batches SET
                name         = COALESCE(?1, name),
                status       = COALESCE(?2, status),
                source_kind  = COALESCE(?3, source_kind),
                source_value = COALESCE(?4, source_value),
                completed_at = COALESCE(completed_at, ?5),
                updated_at   = ?6
             WHERE id = ?7",
            params![
                update.name,
                update.status.map(|s| s.as_str()),
                update.source.as_ref().map(|s| s.kind()),
                update.source.as_ref().map(|s| s.value()),
                completed_at,
                now,
                id.to_string()
            ],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

/// Point a batch and every one of its children at `source`.
///
/// Batch and children are rewritten in one transaction: either every child
/// sees the new source or none does. Returns the number of children updated.
pub fn rewrite_batch_source(conn: &Connection, id: BatchId, source: &SourceRef) -> Result<usize> {
    let now = now();
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| Error::database(e.to_string()))?;

    let found = tx
        .execute(
            "UPDATE batches SET source_kind = ?1, source_value = ?2, updated_at = ?3 WHERE id = ?4",
            params![source.kind(), source.value(), &now, id.to_string()],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    if found == 0 {
        return Err(Error::not_found("batch", id));
    }

    let children = tx
        .execute(
            "UPDATE jobs SET source_kind = ?1, source_value = ?2, updated_at = ?3 WHERE batch_id = ?4",
            params![source.kind(), source.value(), &now, id.to_string()],
        )
        .map_err(|e| Error::database(e.to_string()))?;

    tx.commit().map_err(|e| Error::database(e.to_string()))?;
    Ok(children)
}

/// Recompute a batch's counts and status from its children.
///
/// `total_jobs` is the number of children, so `completed + failed <= total`
/// holds at every observation. The read and the write happen inside one
/// immediate transaction, so concurrent refreshes cannot interleave and move
/// the status backwards.
pub fn refresh_batch_progress(conn: &Connection, id: BatchId) -> Result<Batch> {
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)
        .map_err(|e| Error::database(e.to_string()))?;

    let current = get_batch(&tx, id)?.ok_or_else(|| Error::not_found("batch", id))?;

    let (total, completed, failed, started): (u32, u32, u32, u32) = tx
        .query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(status = 'completed'), 0),
                    COALESCE(SUM(status = 'failed'), 0),
                    COALESCE(SUM(status != 'queued'), 0)
             FROM jobs WHERE batch_id = ?1",
            [id.to_string()],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .map_err(|e| Error::database(e.to_string()))?;

    let counts = BatchCounts {
        total,
        completed,
        failed,
    };
    let status = counts.status(current.status != BatchStatus::Pending || started > 0);
    let now = now();
    let completed_at = status.is_terminal().then(|| now.clone());

    let q = format!(
        "UPDATE batches SET total_jobs = ?1, completed_jobs = ?2, failed_jobs = ?3, status = ?4,
            completed_at = COALESCE(completed_at, ?5), updated_at = ?6
         WHERE id = ?7
         RETURNING {COLS}"
    );
    let batch = tx
        .query_row(
            &q,
            params![
                total,
                completed,
                failed,
                status.as_str(),
                completed_at,
                now,
                id.to_string()
            ],
            Batch::from_row,
        )
        .map_err(|e| Error::database(e.to_string()))?;

    tx.commit().map_err(|e| Error::database(e.to_string()))?;
    Ok(batch)
}

/// Atomically claim the oldest pending batch that has a shared source.
pub fn dequeue_pending_batch(conn: &Connection) -> Result<Option<Batch>> {
    let now = now();
    let q = format!(
        "UPDATE batches SET status = 'processing', updated_at = ?1
         WHERE id = (
             SELECT id FROM batches WHERE status = 'pending' AND source_kind IS NOT NULL
             ORDER BY created_at ASC, rowid ASC LIMIT 1
         )
         RETURNING {COLS}"
    );
    conn.query_row(&q, [now], Batch::from_row)
        .optional()
        .map_err(|e| Error::database(e.to_string()))
}

/// Delete a batch. Its jobs are kept and detached from it.
pub fn delete_batch(conn: &Connection, id: BatchId) -> Result<bool> {
    let n = conn
        .execute("DELETE FROM batches WHERE id = ?1", [id.to_string()])
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}
