//! Rust structs mapping to database tables.
//!
//! Each model implements `from_row` for constructing itself from a
//! `rusqlite::Row` selected with the matching `COLS` list of its query
//! module. JSON columns and enum columns that fail to parse surface as
//! conversion errors rather than being silently defaulted.

use std::str::FromStr;

use cf_core::{
    BatchCounts, BatchId, BatchStatus, ImageId, JobId, JobStatus, PipelineStep, RequestHandle,
    SourceRef, StepId, StepResult,
};
use rusqlite::types::Type;
use serde::de::DeserializeOwned;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// helpers
// ---------------------------------------------------------------------------

fn conversion_err(
    idx: usize,
    e: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into())
}

/// Parse a UUID-based ID from a text column.
fn parse_id<T: From<Uuid>>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<T> {
    let s: String = row.get(idx)?;
    let uuid = Uuid::parse_str(&s).map_err(|e| conversion_err(idx, e))?;
    Ok(T::from(uuid))
}

fn parse_opt_id<T: From<Uuid>>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Option<T>> {
    let s: Option<String> = row.get(idx)?;
    match s {
        Some(v) => {
            let uuid = Uuid::parse_str(&v).map_err(|e| conversion_err(idx, e))?;
            Ok(Some(T::from(uuid)))
        }
        None => Ok(None),
    }
}

fn parse_enum<T>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = cf_core::Error>,
{
    let s: String = row.get(idx)?;
    s.parse().map_err(|e: cf_core::Error| conversion_err(idx, e))
}

fn parse_json<T: DeserializeOwned>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<T> {
    let s: String = row.get(idx)?;
    serde_json::from_str(&s).map_err(|e| conversion_err(idx, e))
}

fn parse_source(
    row: &rusqlite::Row,
    kind_idx: usize,
    value_idx: usize,
) -> rusqlite::Result<Option<SourceRef>> {
    let kind: Option<String> = row.get(kind_idx)?;
    let value: Option<String> = row.get(value_idx)?;
    match (kind, value) {
        (Some(kind), Some(value)) => SourceRef::from_parts(&kind, value)
            .map(Some)
            .map_err(|e| conversion_err(kind_idx, e)),
        _ => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// One pipeline run against one source.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub batch_id: Option<BatchId>,
    pub status: JobStatus,
    /// Snapshot of the pipeline taken at creation.
    pub steps: Vec<PipelineStep>,
    /// Index into the enabled-step subsequence of the next step to run.
    pub current_step: u32,
    pub progress_label: Option<String>,
    pub source: SourceRef,
    pub output_url: Option<String>,
    /// Append-only log of durably published step outputs.
    pub step_results: Vec<StepResult>,
    pub error: Option<String>,
    /// In-flight external generation request, kept for resumption.
    pub pending_request: Option<RequestHandle>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub updated_at: String,
    pub completed_at: Option<String>,
}

impl Job {
    pub fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        let source = parse_source(row, 6, 7)?
            .ok_or_else(|| conversion_err(6, "job row without source"))?;

        let endpoint: Option<String> = row.get(11)?;
        let request_id: Option<String> = row.get(12)?;
        let step_id: Option<String> = row.get(13)?;
        let pending_request = match (endpoint, request_id, step_id) {
            (Some(endpoint), Some(request_id), Some(step_id)) => Some(RequestHandle {
                endpoint,
                request_id,
                step_id: StepId::new(step_id),
            }),
            _ => None,
        };

        Ok(Self {
            id: parse_id(row, 0)?,
            batch_id: parse_opt_id(row, 1)?,
            status: parse_enum(row, 2)?,
            steps: parse_json(row, 3)?,
            current_step: row.get(4)?,
            progress_label: row.get(5)?,
            source,
            output_url: row.get(8)?,
            step_results: parse_json(row, 9)?,
            error: row.get(10)?,
            pending_request,
            created_at: row.get(14)?,
            started_at: row.get(15)?,
            updated_at: row.get(16)?,
            completed_at: row.get(17)?,
        })
    }

    /// The steps that execute, in order.
    pub fn enabled_steps(&self) -> Vec<&PipelineStep> {
        cf_core::enabled_steps(&self.steps)
    }
}

// ---------------------------------------------------------------------------
// Batch
// ---------------------------------------------------------------------------

/// A group of jobs sharing one source.
#[derive(Debug, Clone)]
pub struct Batch {
    pub id: BatchId,
    pub name: String,
    pub status: BatchStatus,
    pub total_jobs: u32,
    pub completed_jobs: u32,
    pub failed_jobs: u32,
    /// Shared source of the children, if the batch was enqueued with one.
    pub source: Option<SourceRef>,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
}

impl Batch {
    pub fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: parse_id(row, 0)?,
            name: row.get(1)?,
            status: parse_enum(row, 2)?,
            total_jobs: row.get(3)?,
            completed_jobs: row.get(4)?,
            failed_jobs: row.get(5)?,
            source: parse_source(row, 6, 7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
            completed_at: row.get(10)?,
        })
    }

    pub fn counts(&self) -> BatchCounts {
        BatchCounts {
            total: self.total_jobs,
            completed: self.completed_jobs,
            failed: self.failed_jobs,
        }
    }
}

// ---------------------------------------------------------------------------
// ReferenceImage
// ---------------------------------------------------------------------------

/// A stored reference image for generate-from-reference steps.
#[derive(Debug, Clone)]
pub struct ReferenceImageRecord {
    pub id: ImageId,
    pub url: String,
    pub label: Option<String>,
    pub created_at: String,
}

impl ReferenceImageRecord {
    pub fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: parse_id(row, 0)?,
            url: row.get(1)?,
            label: row.get(2)?,
            created_at: row.get(3)?,
        })
    }
}
