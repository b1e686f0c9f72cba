//! # cf-av
//!
//! Local media operations and scratch storage for the clipforge pipeline.
//!
//! This crate provides:
//!
//! - **Tool discovery** ([`ToolRegistry`]) -- find and cache paths to ffmpeg
//!   and ffprobe.
//! - **Command execution** ([`ToolCommand`]) -- async builder with timeout
//!   support for running external processes.
//! - **Scratch management** ([`Scratch`], [`ScratchArea`]) -- job-scoped
//!   temporary directories that are removed on every exit path.
//! - **Action functions** ([`actions`]) -- text overlay, audio mixing,
//!   concatenation, audio stripping and trimming, plus ffprobe queries.
//! - **[`Transcoder`]** -- the trait the pipeline engine calls, with the
//!   ffmpeg-backed [`FfmpegTranscoder`] implementation.

pub mod actions;
pub mod command;
pub mod scratch;
pub mod tools;
pub mod transcoder;

// ---- Re-exports for convenience ----

pub use command::{ToolCommand, ToolOutput};
pub use scratch::{Scratch, ScratchArea};
pub use tools::{ToolConfig, ToolInfo, ToolRegistry};
pub use transcoder::{AudioMix, FfmpegTranscoder, Transcoder};
