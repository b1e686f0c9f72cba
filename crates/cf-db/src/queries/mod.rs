//! Query modules, one per table. All functions take a borrowed
//! `rusqlite::Connection` and map driver errors into [`cf_core::Error`].

pub mod batches;
pub mod jobs;
pub mod reference_images;

use chrono::{DateTime, SecondsFormat, Utc};

/// Format a timestamp the way every `*_at` column stores it.
///
/// RFC 3339 UTC with millisecond precision, so stored values compare
/// correctly as strings.
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn now() -> String {
    timestamp(Utc::now())
}
