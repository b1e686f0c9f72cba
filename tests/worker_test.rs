mod common;

use std::time::Duration;

use cf_core::config::Config;
use cf_core::{BatchStatus, JobStatus, SourceRef};
use cf_db::queries::batches;
use cf_pipeline::{claim_next, run_worker, Work};
use common::*;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn idle_queue_has_nothing_to_claim() {
    let h = TestHarness::new();
    assert!(claim_next(&h.ctx).unwrap().is_none());
}

#[tokio::test]
async fn claims_standalone_job() {
    let h = TestHarness::new();
    let job = h.create_job(
        vec![overlay_step("text")],
        SourceRef::Staged(h.fixture_url("source.mp4")),
    );

    let work = claim_next(&h.ctx).unwrap().unwrap();
    assert_eq!(work, Work::Job(job.id));
    assert_eq!(h.get_job(job.id).status, JobStatus::Processing);

    work.run(&h.ctx).await;
    assert_eq!(h.get_job(job.id).status, JobStatus::Completed);
    assert!(claim_next(&h.ctx).unwrap().is_none());
}

#[tokio::test]
async fn batches_are_claimed_before_jobs_and_children_never_alone() {
    let h = TestHarness::new();
    let source = SourceRef::Staged(h.fixture_url("source.mp4"));
    let standalone = h.create_job(vec![overlay_step("text")], source.clone());
    let (batch, children) =
        batches::create_batch_with_jobs(&h.conn(), "pair", &[overlay_step("text")], &source, 2).unwrap();

    let work = claim_next(&h.ctx).unwrap().unwrap();
    assert_eq!(work, Work::Batch(batch.id));
    work.run(&h.ctx).await;

    let batch = batches::get_batch(&h.conn(), batch.id).unwrap().unwrap();
    assert_eq!(batch.status, BatchStatus::Completed);
    for child in children {
        assert_eq!(h.get_job(child.id).status, JobStatus::Completed);
    }
    assert_eq!(h.get_job(standalone.id).status, JobStatus::Queued);

    assert_eq!(claim_next(&h.ctx).unwrap(), Some(Work::Job(standalone.id)));
    assert!(claim_next(&h.ctx).unwrap().is_none());
}

#[tokio::test]
async fn failing_job_is_recorded_not_raised() {
    let h = TestHarness::new();
    let job = h.create_job(
        vec![generate_step("gen", BROKEN_ENDPOINT)],
        SourceRef::Staged(h.fixture_url("source.mp4")),
    );

    claim_next(&h.ctx).unwrap().unwrap().run(&h.ctx).await;
    assert_eq!(h.get_job(job.id).status, JobStatus::Failed);
}

/// Poll until every job in `ids` is terminal or `limit` passes.
async fn wait_terminal(h: &TestHarness, ids: &[cf_core::JobId], limit: Duration) {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if ids.iter().all(|id| h.get_job(*id).status.is_terminal()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn worker_runs_queued_jobs_concurrently() {
    let h = TestHarness::new();
    let source = SourceRef::Staged(h.fixture_url("source.mp4"));
    let a = h.create_job(vec![generate_step("gen", SLOW_ENDPOINT)], source.clone());
    let b = h.create_job(vec![generate_step("gen", SLOW_ENDPOINT)], source);

    let cancel = CancellationToken::new();
    let worker = tokio::spawn(run_worker(h.ctx.clone(), cancel.clone()));

    wait_terminal(&h, &[a.id, b.id], Duration::from_secs(5)).await;
    assert_eq!(h.get_job(a.id).status, JobStatus::Completed);
    assert_eq!(h.get_job(b.id).status, JobStatus::Completed);
    assert_eq!(h.generator.peak_in_flight(), 2, "second job waited for the first");

    cancel.cancel();
    worker.await.unwrap();
}

#[tokio::test]
async fn in_flight_cap_serializes_work() {
    let mut config = Config::default();
    config.engine.worker_max_in_flight = Some(1);
    let h = TestHarness::with_config(config);
    let source = SourceRef::Staged(h.fixture_url("source.mp4"));
    let a = h.create_job(vec![generate_step("gen", SLOW_ENDPOINT)], source.clone());
    let b = h.create_job(vec![generate_step("gen", SLOW_ENDPOINT)], source);

    let cancel = CancellationToken::new();
    let worker = tokio::spawn(run_worker(h.ctx.clone(), cancel.clone()));

    wait_terminal(&h, &[a.id, b.id], Duration::from_secs(5)).await;
    assert_eq!(h.get_job(a.id).status, JobStatus::Completed);
    assert_eq!(h.get_job(b.id).status, JobStatus::Completed);
    assert_eq!(h.generator.peak_in_flight(), 1);

    cancel.cancel();
    worker.await.unwrap();
}

#[tokio::test]
async fn cancellation_waits_for_running_work() {
    let h = TestHarness::new();
    let job = h.create_job(
        vec![generate_step("gen", SLOW_ENDPOINT)],
        SourceRef::Staged(h.fixture_url("source.mp4")),
    );

    let cancel = CancellationToken::new();
    let worker = tokio::spawn(run_worker(h.ctx.clone(), cancel.clone()));

    // Let the worker claim the job and reach the provider.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while h.generator.awaits() == 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cancel.cancel();
    worker.await.unwrap();

    assert_eq!(h.get_job(job.id).status, JobStatus::Completed);
}
