//! Background worker.
//!
//! Polls the database for pending batches and standalone queued jobs. Every
//! claimed unit runs as its own task, so a long generation never holds up
//! other work; the loop keeps claiming while units are in flight, up to
//! `engine.worker_max_in_flight` when set. Batch children are never claimed
//! individually; their batch runs them.

use std::sync::Arc;
use std::time::Duration;

use cf_core::{BatchId, JobId, Result};
use cf_db::queries::{batches, jobs};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::batch::run_batch;
use crate::context::EngineContext;
use crate::runner::run_job;
use crate::sweep::sweep_stuck_jobs;

/// A unit of work claimed from the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Work {
    Batch(BatchId),
    Job(JobId),
}

impl Work {
    /// Run the unit to completion. Failures are logged; the job or batch
    /// record carries the outcome.
    pub async fn run(self, ctx: &EngineContext) {
        match self {
            Work::Batch(batch_id) => match run_batch(ctx, batch_id).await {
                Ok(batch) => {
                    tracing::info!(batch_id = %batch_id, status = %batch.status, "Batch done")
                }
                Err(e) => tracing::error!(batch_id = %batch_id, "Batch run failed: {e}"),
            },
            Work::Job(job_id) => match run_job(ctx, job_id).await {
                Ok(job) => tracing::info!(job_id = %job_id, status = %job.status, "Job done"),
                Err(e) => tracing::error!(job_id = %job_id, "Job run failed: {e}"),
            },
        }
    }
}

/// Atomically claim the next unit: the oldest pending batch first, then the
/// oldest standalone queued job.
pub fn claim_next(ctx: &EngineContext) -> Result<Option<Work>> {
    if let Some(batch) = ctx.with_conn(batches::dequeue_pending_batch)? {
        tracing::info!(batch_id = %batch.id, "Claimed batch");
        return Ok(Some(Work::Batch(batch.id)));
    }

    if let Some(job) = ctx.with_conn(jobs::dequeue_next)? {
        tracing::info!(job_id = %job.id, "Claimed job");
        return Ok(Some(Work::Job(job.id)));
    }

    Ok(None)
}

/// Start the worker loop.
///
/// Runs until the cancellation token is triggered, then stops claiming and
/// waits for the units already in flight.
pub async fn run_worker(ctx: EngineContext, cancel: CancellationToken) {
    tracing::info!("Worker started");
    startup_sweeps(&ctx);

    let idle = Duration::from_secs(ctx.config.engine.poll_interval_secs.max(1));
    let slots = ctx
        .config
        .engine
        .worker_max_in_flight
        .filter(|n| *n > 0)
        .map(|n| Arc::new(Semaphore::new(n)));
    let mut running: JoinSet<()> = JoinSet::new();

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let permit = match &slots {
            Some(sem) => match Arc::clone(sem).try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    // Every slot is taken.
                    tokio::select! {
                        Some(joined) = running.join_next() => reap(joined),
                        _ = cancel.cancelled() => break,
                    }
                    continue;
                }
            },
            None => None,
        };

        match claim_next(&ctx) {
            Ok(Some(work)) => {
                let ctx = ctx.clone();
                running.spawn(async move {
                    let _permit = permit;
                    work.run(&ctx).await;
                });
                continue;
            }
            Ok(None) => {}
            Err(e) => tracing::error!("Worker error: {e}"),
        }

        tokio::select! {
            _ = tokio::time::sleep(idle) => {}
            Some(joined) = running.join_next(), if !running.is_empty() => reap(joined),
            _ = cancel.cancelled() => break,
        }
    }

    if !running.is_empty() {
        tracing::info!(in_flight = running.len(), "Worker shutting down; waiting for running work");
    }
    while let Some(joined) = running.join_next().await {
        reap(joined);
    }

    tracing::info!("Worker stopped");
}

fn reap(joined: std::result::Result<(), JoinError>) {
    if let Err(e) = joined {
        tracing::error!("Worker task aborted: {e}");
    }
}

/// Report jobs orphaned by a previous process and reclaim stale scratch
/// directories. Failures are logged, never fatal.
fn startup_sweeps(ctx: &EngineContext) {
    match sweep_stuck_jobs(ctx, false) {
        Ok(report) if !report.jobs.is_empty() => {
            let resumable = report.jobs.iter().filter(|j| j.resumable).count();
            tracing::warn!(
                stuck = report.jobs.len(),
                resumable,
                "Jobs left in processing by a previous run"
            );
        }
        Ok(_) => {}
        Err(e) => tracing::error!("Stuck-job sweep failed: {e}"),
    }

    let max_age = Duration::from_secs(ctx.config.engine.scratch_max_age_secs);
    match ctx.scratch.sweep(max_age) {
        Ok(0) => {}
        Ok(removed) => tracing::info!(removed, "Removed stale scratch areas"),
        Err(e) => tracing::error!("Scratch sweep failed: {e}"),
    }
}
