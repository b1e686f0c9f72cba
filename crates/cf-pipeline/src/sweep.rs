//! Stuck-job detection.
//!
//! A job left in `processing` past `engine.stuck_after_secs` was most likely
//! orphaned by a dead process. The sweep reports such jobs, marking those that
//! hold a pending generation handle as resumable, and can optionally force
//! them to `failed`.

use cf_core::{BatchId, JobId, Result};
use cf_db::queries::jobs;
use serde::Serialize;

use crate::batch::refresh_batch;
use crate::context::EngineContext;

/// Error text stored on jobs failed by a forced sweep.
pub const STUCK_ERROR: &str = "stuck in processing";

#[derive(Debug, Clone, Serialize)]
pub struct StuckJob {
    pub id: JobId,
    pub batch_id: Option<BatchId>,
    pub started_at: Option<String>,
    pub current_step: u32,
    /// The job has a persisted generation handle and can be resumed by
    /// polling it instead of resubmitting.
    pub resumable: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub jobs: Vec<StuckJob>,
    /// How many of `jobs` were forced to `failed`.
    pub failed: usize,
}

/// List stuck jobs; with `fail`, also mark them failed and refresh their
/// batches.
pub fn sweep_stuck_jobs(ctx: &EngineContext, fail: bool) -> Result<SweepReport> {
    let threshold = ctx.config.engine.stuck_after();
    let stuck = ctx.with_conn(|conn| jobs::list_stuck_jobs(conn, threshold))?;

    let mut report = SweepReport {
        jobs: stuck
            .iter()
            .map(|job| StuckJob {
                id: job.id,
                batch_id: job.batch_id,
                started_at: job.started_at.clone(),
                current_step: job.current_step,
                resumable: job.pending_request.is_some(),
            })
            .collect(),
        failed: 0,
    };

    for job in &report.jobs {
        tracing::warn!(
            job_id = %job.id,
            started_at = job.started_at.as_deref().unwrap_or("-"),
            resumable = job.resumable,
            "Job stuck in processing"
        );
    }

    if !fail {
        return Ok(report);
    }

    let mut failed = 0;
    let mut batches: Vec<BatchId> = Vec::new();
    for job in &report.jobs {
        if ctx.with_conn(|conn| jobs::fail_job(conn, job.id, STUCK_ERROR))? {
            failed += 1;
            if let Some(batch_id) = job.batch_id.filter(|b| !batches.contains(b)) {
                batches.push(batch_id);
            }
        }
    }
    report.failed = failed;
    for batch_id in batches {
        refresh_batch(ctx, batch_id)?;
    }

    tracing::info!(failed = report.failed, "Forced stuck jobs to failed");
    Ok(report)
}
