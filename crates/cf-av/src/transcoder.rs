//! The local media operations the pipeline engine depends on.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use cf_core::{AudioMode, MusicConfig, TextOverlay};

use crate::actions;
use crate::tools::ToolRegistry;

/// Resolved parameters of an audio mix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AudioMix {
    pub mode: AudioMode,
    pub volume: f32,
    pub fade_in_secs: f64,
    pub fade_out_secs: f64,
}

impl AudioMix {
    /// Mix parameters for a mix-audio step, with the effective mode applied.
    pub fn from_config(config: &MusicConfig) -> Self {
        Self {
            mode: config.effective_mode(),
            volume: config.volume,
            fade_in_secs: config.fade_in_secs,
            fade_out_secs: config.fade_out_secs,
        }
    }
}

/// Local media transformations, each reading files and writing `output`.
#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn overlay_text(&self, input: &Path, output: &Path, overlay: &TextOverlay) -> cf_core::Result<()>;

    async fn mix_audio(&self, video: &Path, track: &Path, output: &Path, mix: &AudioMix) -> cf_core::Result<()>;

    /// Join `first` and `second` in that order.
    async fn concat(&self, first: &Path, second: &Path, output: &Path) -> cf_core::Result<()>;

    async fn strip_audio(&self, input: &Path, output: &Path) -> cf_core::Result<()>;

    async fn trim(&self, input: &Path, output: &Path, max_secs: f64) -> cf_core::Result<()>;
}

/// [`Transcoder`] backed by the ffmpeg/ffprobe CLIs.
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    tools: Arc<ToolRegistry>,
}

impl FfmpegTranscoder {
    pub fn new(tools: Arc<ToolRegistry>) -> Self {
        Self { tools }
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn overlay_text(&self, input: &Path, output: &Path, overlay: &TextOverlay) -> cf_core::Result<()> {
        actions::overlay_text(&self.tools, input, output, overlay).await
    }

    async fn mix_audio(&self, video: &Path, track: &Path, output: &Path, mix: &AudioMix) -> cf_core::Result<()> {
        actions::mix_audio(&self.tools, video, track, output, mix).await
    }

    async fn concat(&self, first: &Path, second: &Path, output: &Path) -> cf_core::Result<()> {
        actions::concat(&self.tools, first, second, output).await
    }

    async fn strip_audio(&self, input: &Path, output: &Path) -> cf_core::Result<()> {
        actions::strip_audio(&self.tools, input, output).await
    }

    async fn trim(&self, input: &Path, output: &Path, max_secs: f64) -> cf_core::Result<()> {
        actions::trim(&self.tools, input, output, max_secs).await
    }
}
