//! Job persistence: creation, partial updates, the step-result log and the
//! queries the worker and the stuck-job sweep rely on.

use std::time::Duration;

use cf_core::{BatchId, Error, JobId, JobStatus, PipelineStep, RequestHandle, Result, SourceRef, StepResult};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use super::{now, timestamp};
use crate::models::Job;

const COLS: &str = "id, batch_id, status, steps, current_step, progress_label,
    source_kind, source_value, output_url, step_results, error,
    pending_endpoint, pending_request_id, pending_step_id,
    created_at, started_at, updated_at, completed_at";

/// Fields of a job to be created.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub steps: Vec<PipelineStep>,
    pub source: SourceRef,
    pub batch_id: Option<BatchId>,
}

/// Partial update of a job. `None` leaves the stored value untouched.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub current_step: Option<u32>,
    pub progress_label: Option<String>,
    pub source: Option<SourceRef>,
    pub output_url: Option<String>,
    pub error: Option<String>,
}

/// Create a new job in `queued`.
pub fn create_job(conn: &Connection, new: &NewJob) -> Result<Job> {
    let id = JobId::new();
    let now = now();
    let steps = serde_json::to_string(&new.steps)
        .map_err(|e| Error::Validation(format!("unserializable pipeline: {e}")))?;

    conn.execute(
        "INSERT INTO jobs (id, batch_id, status, steps, source_kind, source_value, created_at, updated_at)
         VALUES (?1, ?2, 'queued', ?3, ?4, ?5, ?6, ?6)",
        params![
            id.to_string(),
            new.batch_id.map(|b| b.to_string()),
            steps,
            new.source.kind(),
            new.source.value(),
            &now
        ],
    )
    .map_err(|e| Error::database(e.to_string()))?;

    Ok(Job {
        id,
        batch_id: new.batch_id,
        status: JobStatus::Queued,
        steps: new.steps.clone(),
        current_step: 0,
        progress_label: None,
        source: new.source.clone(),
        output_url: None,
        step_results: Vec::new(),
        error: None,
        pending_request: None,
        created_at: now.clone(),
        started_at: None,
        updated_at: now,
        completed_at: None,
    })
}

/// Get a job by ID.
pub fn get_job(conn: &Connection, id: JobId) -> Result<Option<Job>> {
    let q = format!("SELECT {COLS} FROM jobs WHERE id = ?1");
    conn.query_row(&q, [id.to_string()], Job::from_row)
        .optional()
        .map_err(|e| Error::database(e.to_string()))
}

/// Merge `update` into the stored job.
pub fn update_job(conn: &Connection, id: JobId, update: &JobUpdate) -> Result<bool> {
    let n = conn
        .execute(
            "UPDATE jobs SET
                status         = COALESCE(?1, status),
                current_step   = COALESCE(?2, current_step),
                progress_label = COALESCE(?3, progress_label),
                source_kind    = COALESCE(?4, source_kind),
                source_value   = COALESCE(?5, source_value),
                output_url     = COALESCE(?6, output_url),
                error          = COALESCE(?7, error),
                updated_at     = ?8
             WHERE id = ?9",
            params![
                update.status.map(|s| s.as_str()),
                update.current_step,
                update.progress_label,
                update.source.as_ref().map(|s| s.kind()),
                update.source.as_ref().map(|s| s.value()),
                update.output_url,
                update.error,
                now(),
                id.to_string()
            ],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

/// Move a queued (or resumed processing) job into `processing` with the
/// label "starting". Returns `false` if the job is terminal or missing.
pub fn start_job(conn: &Connection, id: JobId) -> Result<bool> {
    let now = now();
    let n = conn
        .execute(
            "UPDATE jobs SET status = 'processing', progress_label = 'starting', error = NULL,
                started_at = ?1, updated_at = ?1
             WHERE id = ?2 AND status IN ('queued', 'processing')",
            params![now, id.to_string()],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

/// Record the handle of a just-submitted generation request.
pub fn set_pending_request(conn: &Connection, id: JobId, handle: &RequestHandle) -> Result<bool> {
    let n = conn
        .execute(
            "UPDATE jobs SET pending_endpoint = ?1, pending_request_id = ?2, pending_step_id = ?3,
                updated_at = ?4
             WHERE id = ?5",
            params![
                handle.endpoint,
                handle.request_id,
                handle.step_id.as_str(),
                now(),
                id.to_string()
            ],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

/// Append one entry to the step-result log.
///
/// The cursor, the label and the log entry are written by one statement, and
/// the pending request handle is cleared with them, so the persisted state
/// never shows a step result without its cursor advance (or the reverse).
pub fn record_step_result(
    conn: &Connection,
    id: JobId,
    cursor: u32,
    label: &str,
    result: &StepResult,
) -> Result<bool> {
    let entry = serde_json::to_string(result)
        .map_err(|e| Error::Internal(format!("unserializable step result: {e}")))?;
    let n = conn
        .execute(
            "UPDATE jobs SET
                current_step = ?1,
                progress_label = ?2,
                step_results = json_insert(step_results, '$[#]', json(?3)),
                pending_endpoint = NULL, pending_request_id = NULL, pending_step_id = NULL,
                updated_at = ?4
             WHERE id = ?5 AND status = 'processing'",
            params![cursor, label, entry, now(), id.to_string()],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

/// Mark a job as completed with its final output.
pub fn complete_job(conn: &Connection, id: JobId, output_url: &str) -> Result<bool> {
    let now = now();
    let n = conn
        .execute(
            "UPDATE jobs SET status = 'completed', output_url = ?1, progress_label = 'completed',
                pending_endpoint = NULL, pending_request_id = NULL, pending_step_id = NULL,
                completed_at = ?2, updated_at = ?2
             WHERE id = ?3 AND status = 'processing'",
            params![output_url, now, id.to_string()],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

/// Mark a non-terminal job as failed. The step-result log is left as is.
pub fn fail_job(conn: &Connection, id: JobId, error: &str) -> Result<bool> {
    let now = now();
    let n = conn
        .execute(
            "UPDATE jobs SET status = 'failed', error = ?1, progress_label = 'failed',
                completed_at = ?2, updated_at = ?2
             WHERE id = ?3 AND status IN ('queued', 'processing')",
            params![error, now, id.to_string()],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

/// Fail every non-terminal child of a batch. Returns how many were failed.
pub fn fail_batch_children(conn: &Connection, batch_id: BatchId, error: &str) -> Result<usize> {
    let now = now();
    conn.execute(
        "UPDATE jobs SET status = 'failed', error = ?1, progress_label = 'failed',
            completed_at = ?2, updated_at = ?2
         WHERE batch_id = ?3 AND status IN ('queued', 'processing')",
        params![error, now, batch_id.to_string()],
    )
    .map_err(|e| Error::database(e.to_string()))
}

/// All jobs of a batch, oldest first.
pub fn list_jobs_by_batch(conn: &Connection, batch_id: BatchId) -> Result<Vec<Job>> {
    let q = format!("SELECT {COLS} FROM jobs WHERE batch_id = ?1 ORDER BY created_at ASC, rowid ASC");
    let mut stmt = conn.prepare(&q).map_err(|e| Error::database(e.to_string()))?;
    let rows = stmt
        .query_map([batch_id.to_string()], Job::from_row)
        .map_err(|e| Error::database(e.to_string()))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(rows)
}

/// Jobs that have been `processing` for longer than `threshold`.
pub fn list_stuck_jobs(conn: &Connection, threshold: Duration) -> Result<Vec<Job>> {
    let threshold = chrono::Duration::from_std(threshold)
        .map_err(|e| Error::Validation(format!("stuck threshold out of range: {e}")))?;
    let cutoff = timestamp(Utc::now() - threshold);

    let q = format!(
        "SELECT {COLS} FROM jobs
         WHERE status = 'processing' AND started_at IS NOT NULL AND started_at <= ?1
         ORDER BY started_at ASC"
    );
    let mut stmt = conn.prepare(&q).map_err(|e| Error::database(e.to_string()))?;
    let rows = stmt
        .query_map([cutoff], Job::from_row)
        .map_err(|e| Error::database(e.to_string()))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(rows)
}

/// Atomically claim the oldest queued job that does not belong to a batch.
///
/// Batch children are run by their batch, never picked up individually.
pub fn dequeue_next(conn: &Connection) -> Result<Option<Job>> {
    let now = now();
    let q = format!(
        "UPDATE jobs SET status = 'processing', progress_label = 'starting',
            started_at = ?1, updated_at = ?1
         WHERE id = (
             SELECT id FROM jobs WHERE status = 'queued' AND batch_id IS NULL
             ORDER BY created_at ASC, rowid ASC LIMIT 1
         )
         RETURNING {COLS}"
    );
    conn.query_row(&q, [now], Job::from_row)
        .optional()
        .map_err(|e| Error::database(e.to_string()))
}
