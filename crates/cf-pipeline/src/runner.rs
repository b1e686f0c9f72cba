//! The job runner.
//!
//! A job moves `queued -> processing -> {completed | failed}`. Its enabled
//! steps run strictly in order; after each one the new artifact is published
//! and the step result, cursor and label are persisted in a single update
//! before the next step starts. A job found in `processing` is resumed from
//! its cursor, and a generation request it already submitted is polled
//! rather than submitted again.

use std::path::PathBuf;

use cf_core::events::EventPayload;
use cf_core::{Error, JobId, Result, StepResult};
use cf_db::models::Job;
use cf_db::queries::jobs::{self, JobUpdate};

use crate::batch::refresh_batch;
use crate::context::EngineContext;
use crate::processor::{process_step, referenced_by, Artifacts, StepContext};
use crate::source::{stage_source, url_extension};

/// Run (or resume) a job to a terminal state and return its final record.
///
/// Step failures are not errors of this function: they leave the job
/// `failed` with the error text stored and the step-result log intact. An
/// `Err` means the job could not be run at all (missing, already terminal)
/// or its state could not be persisted.
pub async fn run_job(ctx: &EngineContext, job_id: JobId) -> Result<Job> {
    let job = load_job(ctx, job_id)?;
    if job.status.is_terminal() {
        return Err(Error::Conflict(format!("job {job_id} is already {}", job.status)));
    }
    if !ctx.with_conn(|conn| jobs::start_job(conn, job_id))? {
        return Err(Error::Conflict(format!("job {job_id} could not be started")));
    }

    tracing::info!(
        job_id = %job_id,
        steps = job.enabled_steps().len(),
        cursor = job.current_step,
        resuming = job.pending_request.is_some(),
        "Running job"
    );
    ctx.events.broadcast(EventPayload::JobStarted { job_id });

    let outcome = execute(ctx, &job).await;
    let finished = finish(ctx, job_id, outcome);

    if let Some(batch_id) = job.batch_id {
        if let Err(e) = refresh_batch(ctx, batch_id) {
            tracing::error!(job_id = %job_id, batch_id = %batch_id, "Failed to refresh batch progress: {e}");
        }
    }

    finished?;
    load_job(ctx, job_id)
}

fn load_job(ctx: &EngineContext, job_id: JobId) -> Result<Job> {
    ctx.with_conn(|conn| jobs::get_job(conn, job_id))?
        .ok_or_else(|| Error::not_found("job", job_id))
}

/// Persist the terminal transition, then announce it.
fn finish(ctx: &EngineContext, job_id: JobId, outcome: Result<String>) -> Result<()> {
    match outcome {
        Ok(output_url) => {
            ctx.with_conn(|conn| jobs::complete_job(conn, job_id, &output_url))?;
            tracing::info!(job_id = %job_id, output_url = %output_url, "Job completed");
            ctx.events
                .broadcast(EventPayload::JobCompleted { job_id, output_url });
        }
        Err(e) => {
            let error = e.to_string();
            tracing::error!(job_id = %job_id, error = %error, "Job failed");
            ctx.with_conn(|conn| jobs::fail_job(conn, job_id, &error))?;
            ctx.events.broadcast(EventPayload::JobFailed { job_id, error });
        }
    }
    Ok(())
}

/// Walk the enabled steps from the persisted cursor. Returns the output URL.
///
/// Every local file lives in one scratch area that is removed when this
/// returns, on success and on failure.
async fn execute(ctx: &EngineContext, job: &Job) -> Result<String> {
    let area = ctx.scratch.area(&format!("job-{}", job.id))?;

    let source = stage_source(ctx, &job.source).await?;
    if source != job.source {
        let update = JobUpdate {
            source: Some(source.clone()),
            ..Default::default()
        };
        ctx.with_conn(|conn| jobs::update_job(conn, job.id, &update))?;
    }

    let steps = job.enabled_steps();
    let total = steps.len();
    if total == 0 {
        return Ok(source.value().to_string());
    }

    let cursor = (job.current_step as usize).min(total);
    if cursor != job.step_results.len() {
        return Err(Error::Internal(format!(
            "job {} has cursor {cursor} but {} step results",
            job.id,
            job.step_results.len()
        )));
    }
    if cursor == total {
        // Every step was recorded before the process stopped.
        return last_output(&job.step_results, job.id);
    }

    let mut current = if steps[cursor].needs_input_video() {
        let url = match cursor {
            0 => source.value().to_string(),
            _ => last_output(&job.step_results, job.id)?,
        };
        let path = area.file("input", &url_extension(&url, "mp4"));
        ctx.store.stage(&url, &path).await?;
        Some(path)
    } else {
        None
    };

    let mut artifacts = Artifacts::from_results(&job.step_results);
    let mut output_url = String::new();

    for (index, step) in steps.iter().enumerate().skip(cursor) {
        let kind = step.kind();
        let label = format!("step {}/{total}: {}", index + 1, kind.label());

        let update = JobUpdate {
            progress_label: Some(label.clone()),
            ..Default::default()
        };
        ctx.with_conn(|conn| jobs::update_job(conn, job.id, &update))?;
        tracing::info!(job_id = %job.id, step = %kind, step_id = %step.id, "{label}");
        ctx.events.broadcast(EventPayload::StepStarted {
            job_id: job.id,
            step_id: step.id.clone(),
            label: label.clone(),
        });

        let sc = StepContext {
            job_id: job.id,
            area: &area,
            resume: job.pending_request.as_ref(),
            artifacts: &artifacts,
        };
        let output: PathBuf = process_step(ctx, &sc, step, current.as_deref(), index).await?;
        let url = ctx
            .store
            .publish(&output)
            .await
            .map_err(|e| Error::step(kind.label(), e))?;

        let result = StepResult {
            step_id: step.id.clone(),
            step_type: kind,
            label: kind.label().to_string(),
            output_url: url.clone(),
        };
        let cursor = u32::try_from(index + 1)
            .map_err(|_| Error::Internal("step cursor out of range".into()))?;
        if !ctx.with_conn(|conn| jobs::record_step_result(conn, job.id, cursor, &label, &result))? {
            return Err(Error::Conflict(format!("job {} is no longer processing", job.id)));
        }
        ctx.events.broadcast(EventPayload::StepCompleted {
            job_id: job.id,
            step_id: step.id.clone(),
            output_url: url.clone(),
        });

        // Advance. The previous artifact goes unless a later attach-clip
        // step still needs it.
        let remaining = &steps[index + 1..];
        artifacts.record(step.id.clone(), url.clone());
        if referenced_by(remaining, &step.id) {
            artifacts.hold(step.id.clone(), output.clone());
        }
        let previous = current.replace(output);
        artifacts.prune(&area, |id| referenced_by(remaining, id), current.as_deref());
        if let Some(previous) = previous {
            if !artifacts.holds(&previous) {
                area.release(&previous);
            }
        }

        output_url = url;
    }

    Ok(output_url)
}

fn last_output(results: &[StepResult], job_id: JobId) -> Result<String> {
    results
        .last()
        .map(|r| r.output_url.clone())
        .ok_or_else(|| Error::Internal(format!("job {job_id} has no step results to resume from")))
}

