//! Unified error type for clipforge.
//!
//! All crates funnel their failures into [`Error`]. The engine only ever
//! retries [`Error::Resolution`] failures flagged as retryable; every other
//! variant fails the enclosing job immediately.

use std::fmt;

/// Unified error type covering all failure modes in clipforge.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested entity could not be found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// The kind of entity (e.g. "job", "batch").
        entity: String,
        /// The identifier that was looked up.
        id: String,
    },

    /// Input data failed validation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The entity is in a state that does not allow the operation.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A database operation failed.
    #[error("Database error: {source}")]
    Database {
        /// The underlying database error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// An I/O operation failed.
    #[error("IO error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// The external lookup service could not turn a source reference into a
    /// playable URL.
    #[error("Resolution error: {message}")]
    Resolution {
        /// Whether another attempt may succeed (rate limited, server error).
        retryable: bool,
        /// Human-readable error description.
        message: String,
    },

    /// The external generation provider produced no usable artifact.
    #[error("Generation error: {0}")]
    Generation(String),

    /// A local media operation (ffmpeg, ffprobe) failed.
    #[error("Transcode error [{tool}]: {message}")]
    Transcode {
        /// Name of the tool that failed.
        tool: String,
        /// Human-readable error description.
        message: String,
    },

    /// A pipeline step is missing a required input.
    #[error("Config error: {0}")]
    Config(String),

    /// Download from or upload to durable storage failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A pipeline step failed; tags the inner error with the step label.
    #[error("{step}: {source}")]
    Step {
        /// Step label, e.g. "overlay-text".
        step: String,
        /// The error raised while processing the step.
        source: Box<Error>,
    },

    /// Catch-all for unexpected internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the engine may retry the operation that produced this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Resolution { retryable, .. } => *retryable,
            Error::Step { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// Strip any [`Error::Step`] wrappers and return the underlying error.
    pub fn root(&self) -> &Error {
        match self {
            Error::Step { source, .. } => source.root(),
            other => other,
        }
    }

    /// Convenience constructor for [`Error::NotFound`].
    pub fn not_found(entity: impl Into<String>, id: impl fmt::Display) -> Self {
        Error::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    /// Convenience constructor for [`Error::Database`].
    pub fn database(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Error::Database {
            source: source.into(),
        }
    }

    /// Convenience constructor for [`Error::Transcode`].
    pub fn transcode(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Transcode {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Convenience constructor for [`Error::Resolution`].
    pub fn resolution(retryable: bool, message: impl Into<String>) -> Self {
        Error::Resolution {
            retryable,
            message: message.into(),
        }
    }

    /// Wrap `source` in an [`Error::Step`] tagged with `step`.
    pub fn step(step: impl Into<String>, source: Error) -> Self {
        Error::Step {
            step: step.into(),
            source: Box::new(source),
        }
    }
}

/// Result alias using the crate-level [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
