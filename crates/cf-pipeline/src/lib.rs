//! # cf-pipeline
//!
//! The pipeline execution engine.
//!
//! This crate provides:
//!
//! - **[`EngineContext`]** -- the shared handles every operation runs
//!   against (database pool, object store, generation provider, resolver,
//!   transcoder, scratch root, event bus, configuration).
//! - **[`process_step`]** -- the step processor: one enabled pipeline step
//!   turned from an input artifact into a new local artifact.
//! - **[`run_job`]** -- the job runner: a resumable, sequential walk over a
//!   job's enabled steps with every result checkpointed in the database.
//! - **[`run_batch`]** -- the batch coordinator: one shared source staged
//!   once, then all children run concurrently and in isolation.
//! - **[`sweep_stuck_jobs`]** -- detection (and optional forced failure) of
//!   jobs left in `processing` by a dead process.
//! - **[`run_worker`]** -- the background polling loop; every claimed
//!   [`Work`] unit runs as its own task.

pub mod batch;
pub mod context;
pub mod processor;
pub mod runner;
pub mod source;
pub mod sweep;
pub mod worker;

pub use batch::run_batch;
pub use context::EngineContext;
pub use processor::{process_step, Artifacts, StepContext};
pub use runner::run_job;
pub use source::stage_source;
pub use sweep::{sweep_stuck_jobs, StuckJob, SweepReport};
pub use worker::{claim_next, run_worker, Work};
