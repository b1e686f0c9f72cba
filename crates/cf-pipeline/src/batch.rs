//! The batch coordinator.
//!
//! All children of a batch share one source. It is resolved and staged once,
//! every child is pointed at the staged copy in one transaction, and only
//! then do the children run, concurrently and isolated from each other. The
//! batch's counts and status are recomputed after every child finishes.

use std::sync::Arc;

use cf_core::events::EventPayload;
use cf_core::{BatchId, BatchStatus, Error, Result};
use cf_db::models::Batch;
use cf_db::queries::batches::{self, BatchUpdate};
use cf_db::queries::jobs;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::context::EngineContext;
use crate::runner::run_job;
use crate::source::stage_source;

/// Run every non-terminal child of a batch and return the final batch.
///
/// If staging the shared source fails, no child runs: each one is failed
/// with the staging error and the batch ends `failed`. A child that errors
/// or panics is failed on its own; its siblings keep running.
pub async fn run_batch(ctx: &EngineContext, batch_id: BatchId) -> Result<Batch> {
    let batch = ctx
        .with_conn(|conn| batches::get_batch(conn, batch_id))?
        .ok_or_else(|| Error::not_found("batch", batch_id))?;
    if batch.status.is_terminal() {
        return Err(Error::Conflict(format!("batch {batch_id} is already {}", batch.status)));
    }
    let shared = batch
        .source
        .clone()
        .ok_or_else(|| Error::Validation(format!("batch {batch_id} has no shared source")))?;

    let processing = BatchUpdate {
        status: Some(BatchStatus::Processing),
        ..Default::default()
    };
    ctx.with_conn(|conn| batches::update_batch(conn, batch_id, &processing))?;

    let children = ctx.with_conn(|conn| jobs::list_jobs_by_batch(conn, batch_id))?;
    tracing::info!(batch_id = %batch_id, name = %batch.name, children = children.len(), "Running batch");

    if children.is_empty() {
        let done = BatchUpdate {
            status: Some(BatchStatus::Completed),
            ..Default::default()
        };
        ctx.with_conn(|conn| batches::update_batch(conn, batch_id, &done))?;
        return ctx
            .with_conn(|conn| batches::get_batch(conn, batch_id))?
            .ok_or_else(|| Error::not_found("batch", batch_id));
    }

    match stage_source(ctx, &shared).await {
        Ok(staged) => {
            let rewritten = ctx.with_conn(|conn| batches::rewrite_batch_source(conn, batch_id, &staged))?;
            tracing::debug!(batch_id = %batch_id, rewritten, "Children point at the staged source");
        }
        Err(e) => {
            let error = format!("shared source staging failed: {e}");
            tracing::error!(batch_id = %batch_id, error = %error, "Batch failed before any child ran");
            ctx.with_conn(|conn| jobs::fail_batch_children(conn, batch_id, &error))?;
            return refresh_batch(ctx, batch_id);
        }
    }

    let limit = ctx.config.engine.max_concurrent_jobs.filter(|n| *n > 0);
    let permits = limit.map(|n| Arc::new(Semaphore::new(n)));

    let mut tasks = JoinSet::new();
    for child in children.iter().filter(|j| !j.status.is_terminal()) {
        let ctx = ctx.clone();
        let permits = permits.clone();
        let job_id = child.id;
        tasks.spawn(async move {
            let _permit = match permits {
                Some(sem) => sem.acquire_owned().await.ok(),
                None => None,
            };
            (job_id, run_job(&ctx, job_id).await)
        });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((job_id, Ok(job))) => {
                tracing::debug!(batch_id = %batch_id, job_id = %job_id, status = %job.status, "Batch child finished");
            }
            Ok((job_id, Err(e))) => {
                tracing::warn!(batch_id = %batch_id, job_id = %job_id, "Batch child could not run: {e}");
                if let Err(e) = ctx.with_conn(|conn| jobs::fail_job(conn, job_id, &e.to_string())) {
                    tracing::error!(job_id = %job_id, "Failed to mark batch child failed: {e}");
                }
                // Never return from the join loop: dropping `tasks` aborts the running siblings.
                if let Err(e) = refresh_batch(ctx, batch_id) {
                    tracing::error!(batch_id = %batch_id, "Failed to refresh batch progress: {e}");
                }
            }
            Err(e) => {
                tracing::error!(batch_id = %batch_id, "Batch child task aborted: {e}");
            }
        }
    }

    // A child whose task panicked is still non-terminal; close it out so the
    // batch can reach a terminal status.
    let abandoned = ctx.with_conn(|conn| jobs::fail_batch_children(conn, batch_id, "job task aborted"))?;
    if abandoned > 0 {
        tracing::warn!(batch_id = %batch_id, abandoned, "Failed abandoned batch children");
    }

    let batch = refresh_batch(ctx, batch_id)?;
    tracing::info!(
        batch_id = %batch_id,
        status = %batch.status,
        completed = batch.completed_jobs,
        failed = batch.failed_jobs,
        total = batch.total_jobs,
        "Batch finished"
    );
    Ok(batch)
}

/// Recompute a batch's counts and status and announce the result.
pub(crate) fn refresh_batch(ctx: &EngineContext, batch_id: BatchId) -> Result<Batch> {
    let batch = ctx.with_conn(|conn| batches::refresh_batch_progress(conn, batch_id))?;
    ctx.events.broadcast(EventPayload::BatchProgress {
        batch_id,
        status: batch.status,
        completed: batch.completed_jobs,
        failed: batch.failed_jobs,
        total: batch.total_jobs,
    });
    Ok(batch)
}
