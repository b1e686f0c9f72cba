//! Pipeline data model: steps, their typed configuration, job and batch
//! status enums, and the small records persisted alongside a job.
//!
//! Step configuration is a closed sum type ([`StepConfig`]) so that the step
//! processor's dispatch is exhaustive.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ids::{ImageId, StepId};
use crate::Error;

// ---------------------------------------------------------------------------
// StepKind
// ---------------------------------------------------------------------------

/// The four supported step types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepKind {
    GenerateFromReference,
    OverlayText,
    MixAudio,
    AttachClip,
}

impl StepKind {
    /// Stable tag used in labels, logs and persisted step results.
    pub fn label(&self) -> &'static str {
        match self {
            StepKind::GenerateFromReference => "generate-from-reference",
            StepKind::OverlayText => "overlay-text",
            StepKind::MixAudio => "mix-audio",
            StepKind::AttachClip => "attach-clip",
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ---------------------------------------------------------------------------
// Step configuration
// ---------------------------------------------------------------------------

/// Where the reference image of a generation step comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceImage {
    /// A directly usable image URL.
    Url(String),
    /// A previously stored reference image, looked up by id.
    Stored(ImageId),
}

/// Configuration for a generate-from-reference step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateConfig {
    /// Provider endpoint (model path) the work is submitted to.
    pub endpoint: String,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub reference_image: Option<ReferenceImage>,
    /// When `false` the step is pure image-to-video and ignores the current
    /// artifact.
    #[serde(default = "default_true")]
    pub requires_input_video: bool,
    /// The input video is trimmed to this length before upload.
    #[serde(default = "default_max_duration")]
    pub max_duration_secs: f64,
    /// `Some(false)` strips the generated audio track as a post-pass.
    #[serde(default)]
    pub generate_audio: Option<bool>,
    #[serde(default)]
    pub resolution: Option<String>,
    #[serde(default)]
    pub aspect_ratio: Option<String>,
}

impl GenerateConfig {
    /// Whether the produced video must have its audio removed.
    pub fn strips_audio(&self) -> bool {
        self.generate_audio == Some(false)
    }
}

fn default_true() -> bool {
    true
}

fn default_max_duration() -> f64 {
    10.0
}

/// Vertical placement of overlaid text.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextPosition {
    Top,
    Center,
    #[default]
    Bottom,
    /// Raw drawtext expressions, e.g. `x = "(w-text_w)/2"`.
    Custom { x: String, y: String },
}

/// Configuration for an overlay-text step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextOverlay {
    pub text: String,
    /// Font family name or path to a font file.
    #[serde(default)]
    pub font: Option<String>,
    #[serde(default = "default_font_size")]
    pub font_size: u32,
    #[serde(default = "default_color")]
    pub color: String,
    #[serde(default)]
    pub position: TextPosition,
    #[serde(default)]
    pub start_secs: Option<f64>,
    #[serde(default)]
    pub end_secs: Option<f64>,
    /// Background box color; no box when unset.
    #[serde(default)]
    pub box_color: Option<String>,
}

fn default_font_size() -> u32 {
    48
}

fn default_color() -> String {
    "white".into()
}

/// How a music track is combined with the video's own audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioMode {
    #[default]
    Mix,
    Replace,
}

/// Configuration for a mix-audio step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MusicConfig {
    pub track_url: String,
    #[serde(default = "default_volume")]
    pub volume: f32,
    #[serde(default)]
    pub fade_in_secs: f64,
    #[serde(default)]
    pub fade_out_secs: f64,
    /// Per-target-step audio mode overrides.
    #[serde(default)]
    pub target_modes: BTreeMap<StepId, AudioMode>,
}

fn default_volume() -> f32 {
    1.0
}

impl MusicConfig {
    /// `Replace` if any targeted step asks for it, otherwise `Mix`.
    pub fn effective_mode(&self) -> AudioMode {
        if self
            .target_modes
            .values()
            .any(|mode| *mode == AudioMode::Replace)
        {
            AudioMode::Replace
        } else {
            AudioMode::Mix
        }
    }
}

/// Whether an attached clip plays before or after the current video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClipPosition {
    Before,
    #[default]
    After,
}

/// Configuration for an attach-clip step.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ClipConfig {
    #[serde(default)]
    pub position: ClipPosition,
    /// Reuse the artifact produced by another step of the same pipeline.
    #[serde(default)]
    pub from_step: Option<StepId>,
    /// External video reference that must go through the resolver.
    #[serde(default)]
    pub video_ref: Option<String>,
    /// Directly uploaded clip URL.
    #[serde(default)]
    pub upload_url: Option<String>,
}

/// The clip source picked by [`ClipConfig::source`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClipSource<'a> {
    Step(&'a StepId),
    External(&'a str),
    Uploaded(&'a str),
}

impl ClipConfig {
    /// Pick the clip source: step artifact, then external reference, then
    /// uploaded URL.
    pub fn source(&self) -> Option<ClipSource<'_>> {
        if let Some(step) = &self.from_step {
            return Some(ClipSource::Step(step));
        }
        if let Some(reference) = self.video_ref.as_deref().filter(|s| !s.is_empty()) {
            return Some(ClipSource::External(reference));
        }
        self.upload_url
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(ClipSource::Uploaded)
    }
}

/// Type-specific step configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StepConfig {
    GenerateFromReference(GenerateConfig),
    OverlayText(TextOverlay),
    MixAudio(MusicConfig),
    AttachClip(ClipConfig),
}

/// One element of a job's ordered pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStep {
    pub id: StepId,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub config: StepConfig,
}

impl PipelineStep {
    pub fn kind(&self) -> StepKind {
        match &self.config {
            StepConfig::GenerateFromReference(_) => StepKind::GenerateFromReference,
            StepConfig::OverlayText(_) => StepKind::OverlayText,
            StepConfig::MixAudio(_) => StepKind::MixAudio,
            StepConfig::AttachClip(_) => StepKind::AttachClip,
        }
    }

    /// Whether this step consumes the current video artifact.
    pub fn needs_input_video(&self) -> bool {
        match &self.config {
            StepConfig::GenerateFromReference(cfg) => cfg.requires_input_video,
            _ => true,
        }
    }
}

/// The subsequence of steps that actually executes.
pub fn enabled_steps(steps: &[PipelineStep]) -> Vec<&PipelineStep> {
    steps.iter().filter(|s| s.enabled).collect()
}

// ---------------------------------------------------------------------------
// Job-side records
// ---------------------------------------------------------------------------

/// Where a job's input video comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum SourceRef {
    /// Needs the resolver before it can be downloaded (e.g. a social post URL).
    External(String),
    /// Already copied into durable storage.
    Staged(String),
}

impl SourceRef {
    pub fn is_staged(&self) -> bool {
        matches!(self, SourceRef::Staged(_))
    }

    /// Stable column tag used by persistence.
    pub fn kind(&self) -> &'static str {
        match self {
            SourceRef::External(_) => "external",
            SourceRef::Staged(_) => "staged",
        }
    }

    pub fn value(&self) -> &str {
        match self {
            SourceRef::External(v) | SourceRef::Staged(v) => v,
        }
    }

    /// Rebuild from a persisted `(kind, value)` pair.
    pub fn from_parts(kind: &str, value: String) -> crate::Result<Self> {
        match kind {
            "external" => Ok(SourceRef::External(value)),
            "staged" => Ok(SourceRef::Staged(value)),
            other => Err(Error::Validation(format!("unknown source kind '{other}'"))),
        }
    }
}

/// Durable handle of an in-flight external generation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestHandle {
    pub endpoint: String,
    pub request_id: String,
    /// The step that submitted the request.
    pub step_id: StepId,
}

/// One entry of a job's append-only step-result log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: StepId,
    pub step_type: StepKind,
    pub label: String,
    pub output_url: String,
}

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// Lifecycle of a job: `queued -> processing -> {completed | failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(Error::Validation(format!("unknown job status '{other}'"))),
        }
    }
}

/// Aggregate status of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Partial,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Processing => "processing",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
            BatchStatus::Partial => "partial",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Completed | BatchStatus::Failed | BatchStatus::Partial
        )
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "pending" => Ok(BatchStatus::Pending),
            "processing" => Ok(BatchStatus::Processing),
            "completed" => Ok(BatchStatus::Completed),
            "failed" => Ok(BatchStatus::Failed),
            "partial" => Ok(BatchStatus::Partial),
            other => Err(Error::Validation(format!("unknown batch status '{other}'"))),
        }
    }
}

/// Child-job tallies of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BatchCounts {
    pub total: u32,
    pub completed: u32,
    pub failed: u32,
}

impl BatchCounts {
    /// Every child has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.total > 0 && self.completed + self.failed == self.total
    }

    /// Status implied by the counts.
    ///
    /// Non-terminal batches stay `Pending` until `started` is set.
    pub fn status(&self, started: bool) -> BatchStatus {
        if !self.is_terminal() {
            return if started {
                BatchStatus::Processing
            } else {
                BatchStatus::Pending
            };
        }
        if self.failed == 0 {
            BatchStatus::Completed
        } else if self.completed == 0 {
            BatchStatus::Failed
        } else {
            BatchStatus::Partial
        }
    }
}
