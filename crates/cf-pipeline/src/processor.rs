//! The step processor.
//!
//! [`process_step`] runs one enabled pipeline step: it takes the current
//! local artifact (absent only when the step needs no input video) and
//! produces a new local artifact in the job's scratch area. The input is
//! never modified in place; deleting it is the caller's decision.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use cf_av::{AudioMix, ScratchArea};
use cf_core::events::EventPayload;
use cf_core::{
    ClipConfig, ClipPosition, ClipSource, Error, GenerateConfig, JobId, MusicConfig,
    PipelineStep, ProgressSender, ReferenceImage, RequestHandle, Result, StepConfig, StepId,
    StepResult, TextOverlay,
};
use cf_db::queries::{jobs, reference_images};
use serde_json::json;

use crate::context::EngineContext;
use crate::source::url_extension;

// ---------------------------------------------------------------------------
// Artifacts
// ---------------------------------------------------------------------------

/// Outputs of earlier steps of the same job, by step id.
///
/// Every recorded step has a durable URL. A step whose local file is still
/// needed by a later attach-clip step is also held here by path until that
/// step has run.
#[derive(Debug, Default)]
pub struct Artifacts {
    published: HashMap<StepId, String>,
    held: HashMap<StepId, PathBuf>,
}

impl Artifacts {
    /// Seed from a persisted step-result log.
    pub fn from_results(results: &[StepResult]) -> Self {
        Self {
            published: results
                .iter()
                .map(|r| (r.step_id.clone(), r.output_url.clone()))
                .collect(),
            held: HashMap::new(),
        }
    }

    pub fn record(&mut self, step_id: StepId, url: String) {
        self.published.insert(step_id, url);
    }

    /// Keep `path` alive as the local artifact of `step_id`.
    pub fn hold(&mut self, step_id: StepId, path: PathBuf) {
        self.held.insert(step_id, path);
    }

    pub fn url(&self, step_id: &StepId) -> Option<&str> {
        self.published.get(step_id).map(String::as_str)
    }

    pub fn local(&self, step_id: &StepId) -> Option<&Path> {
        self.held.get(step_id).map(PathBuf::as_path)
    }

    /// Whether `path` is held for some step.
    pub fn holds(&self, path: &Path) -> bool {
        self.held.values().any(|p| p == path)
    }

    /// Stop holding every artifact for which `needed` is false and release
    /// its file, except `keep`.
    pub fn prune(
        &mut self,
        area: &ScratchArea,
        needed: impl Fn(&StepId) -> bool,
        keep: Option<&Path>,
    ) {
        self.held.retain(|id, path| {
            if needed(id) {
                return true;
            }
            if keep != Some(path.as_path()) {
                area.release(path);
            }
            false
        });
    }
}

/// Whether any of `steps` is an attach-clip that takes its clip from
/// `step_id`.
pub(crate) fn referenced_by(steps: &[&PipelineStep], step_id: &StepId) -> bool {
    steps.iter().any(|s| match &s.config {
        StepConfig::AttachClip(clip) => clip.from_step.as_ref() == Some(step_id),
        _ => false,
    })
}

// ---------------------------------------------------------------------------
// process_step
// ---------------------------------------------------------------------------

/// Per-job state a step is processed against.
pub struct StepContext<'a> {
    pub job_id: JobId,
    pub area: &'a ScratchArea,
    /// Handle of a generation request submitted by an earlier, interrupted
    /// run. Only used by the step whose id it carries.
    pub resume: Option<&'a RequestHandle>,
    pub artifacts: &'a Artifacts,
}

/// Run `step` (the `index`-th enabled step) against `current` and return the
/// path of the new artifact.
///
/// Errors are tagged with the step type label.
pub async fn process_step(
    ctx: &EngineContext,
    sc: &StepContext<'_>,
    step: &PipelineStep,
    current: Option<&Path>,
    index: usize,
) -> Result<PathBuf> {
    let kind = step.kind();
    tracing::debug!(job_id = %sc.job_id, step = %kind, step_id = %step.id, index, "Processing step");

    let result = match &step.config {
        StepConfig::GenerateFromReference(cfg) => {
            generate(ctx, sc, &step.id, cfg, current, index).await
        }
        StepConfig::OverlayText(overlay) => overlay_text(ctx, sc, overlay, current, index).await,
        StepConfig::MixAudio(music) => mix_audio(ctx, sc, music, current, index).await,
        StepConfig::AttachClip(clip) => attach_clip(ctx, sc, clip, current, index).await,
    };

    result.map_err(|e| Error::step(kind.label(), e))
}

fn require_input(current: Option<&Path>) -> Result<&Path> {
    current.ok_or_else(|| Error::Config("step needs an input video but none is available".into()))
}

// -- generate-from-reference -------------------------------------------------

async fn generate(
    ctx: &EngineContext,
    sc: &StepContext<'_>,
    step_id: &StepId,
    cfg: &GenerateConfig,
    current: Option<&Path>,
    index: usize,
) -> Result<PathBuf> {
    let handle = match sc.resume.filter(|h| &h.step_id == step_id) {
        Some(handle) => {
            tracing::info!(
                job_id = %sc.job_id,
                request_id = %handle.request_id,
                "Resuming generation request"
            );
            handle.clone()
        }
        None => submit_generation(ctx, sc, step_id, cfg, current, index).await?,
    };

    let events = ctx.events.clone();
    let job_id = sc.job_id;
    let progress = ProgressSender::new(move |status: &str| {
        events.broadcast(EventPayload::GenerationStatus {
            job_id,
            status: status.to_string(),
        });
    });

    ctx.generator
        .await_completion(&handle.endpoint, &handle.request_id, &progress)
        .await?;
    let url = ctx
        .generator
        .fetch_result(&handle.endpoint, &handle.request_id)
        .await?;

    let generated = sc
        .area
        .file(&format!("step{index}-generated"), &url_extension(&url, "mp4"));
    ctx.store.stage(&url, &generated).await?;
    if !cfg.strips_audio() {
        return Ok(generated);
    }

    let silent = sc.area.file(&format!("step{index}-silent"), "mp4");
    let stripped = ctx.transcoder.strip_audio(&generated, &silent).await;
    sc.area.release(&generated);
    stripped.map(|()| silent)
}

/// Build the provider input, submit it and persist the returned handle
/// before anything waits on it.
async fn submit_generation(
    ctx: &EngineContext,
    sc: &StepContext<'_>,
    step_id: &StepId,
    cfg: &GenerateConfig,
    current: Option<&Path>,
    index: usize,
) -> Result<RequestHandle> {
    let image_url = reference_image_url(ctx, cfg)?;

    let mut input = json!({ "image_url": image_url });
    if let Some(prompt) = cfg.prompt.as_deref().filter(|p| !p.is_empty()) {
        input["prompt"] = json!(prompt);
    }
    if let Some(resolution) = &cfg.resolution {
        input["resolution"] = json!(resolution);
    }
    if let Some(aspect_ratio) = &cfg.aspect_ratio {
        input["aspect_ratio"] = json!(aspect_ratio);
    }
    if let Some(generate_audio) = cfg.generate_audio {
        input["generate_audio"] = json!(generate_audio);
    }

    if cfg.requires_input_video {
        let current = require_input(current)?;
        let trimmed = sc.area.file(&format!("step{index}-trimmed"), "mp4");
        let uploaded = match ctx.transcoder.trim(current, &trimmed, cfg.max_duration_secs).await {
            Ok(()) => ctx.store.publish(&trimmed).await,
            Err(e) => Err(e),
        };
        sc.area.release(&trimmed);
        input["video_url"] = json!(uploaded?);
    }

    let request_id = ctx.generator.submit(&cfg.endpoint, &input).await?;
    let handle = RequestHandle {
        endpoint: cfg.endpoint.clone(),
        request_id,
        step_id: step_id.clone(),
    };
    ctx.with_conn(|conn| jobs::set_pending_request(conn, sc.job_id, &handle))?;

    ctx.events.broadcast(EventPayload::GenerationQueued {
        job_id: sc.job_id,
        request_id: handle.request_id.clone(),
    });
    Ok(handle)
}

fn reference_image_url(ctx: &EngineContext, cfg: &GenerateConfig) -> Result<String> {
    match &cfg.reference_image {
        Some(ReferenceImage::Url(url)) if !url.is_empty() => Ok(url.clone()),
        Some(ReferenceImage::Stored(id)) => ctx
            .with_conn(|conn| reference_images::get_reference_image(conn, *id))?
            .map(|image| image.url)
            .ok_or_else(|| Error::Config(format!("reference image {id} does not exist"))),
        _ => Err(Error::Config("no reference image configured".into())),
    }
}

// -- overlay-text ---------------------------------------------------------------

async fn overlay_text(
    ctx: &EngineContext,
    sc: &StepContext<'_>,
    overlay: &TextOverlay,
    current: Option<&Path>,
    index: usize,
) -> Result<PathBuf> {
    let current = require_input(current)?;
    let output = sc.area.file(&format!("step{index}-overlay"), "mp4");
    ctx.transcoder.overlay_text(current, &output, overlay).await?;
    Ok(output)
}

// -- mix-audio ------------------------------------------------------------------

async fn mix_audio(
    ctx: &EngineContext,
    sc: &StepContext<'_>,
    music: &MusicConfig,
    current: Option<&Path>,
    index: usize,
) -> Result<PathBuf> {
    let current = require_input(current)?;
    let track = sc
        .area
        .file(&format!("step{index}-track"), &url_extension(&music.track_url, "mp3"));
    let output = sc.area.file(&format!("step{index}-mixed"), "mp4");

    let mixed = match ctx.store.stage(&music.track_url, &track).await {
        Ok(()) => {
            ctx.transcoder
                .mix_audio(current, &track, &output, &AudioMix::from_config(music))
                .await
        }
        Err(e) => Err(e),
    };
    sc.area.release(&track);
    mixed.map(|()| output)
}

// -- attach-clip ----------------------------------------------------------------

async fn attach_clip(
    ctx: &EngineContext,
    sc: &StepContext<'_>,
    clip: &ClipConfig,
    current: Option<&Path>,
    index: usize,
) -> Result<PathBuf> {
    let current = require_input(current)?;
    let source = clip
        .source()
        .ok_or_else(|| Error::Config("no clip source configured".into()))?;

    // `fresh` clips were downloaded here and are ours to delete.
    let (clip_path, fresh) = match source {
        ClipSource::Step(step_id) => match sc.artifacts.local(step_id) {
            Some(path) => (path.to_path_buf(), false),
            None => {
                let url = sc.artifacts.url(step_id).ok_or_else(|| {
                    Error::Config(format!("step '{step_id}' has not produced an artifact"))
                })?;
                (stage_clip(ctx, sc, url, index).await?, true)
            }
        },
        ClipSource::External(reference) => {
            let url = ctx.resolver.resolve(reference).await?;
            (stage_clip(ctx, sc, &url, index).await?, true)
        }
        ClipSource::Uploaded(url) => (stage_clip(ctx, sc, url, index).await?, true),
    };

    let output = sc.area.file(&format!("step{index}-joined"), "mp4");
    let (first, second) = match clip.position {
        ClipPosition::Before => (clip_path.as_path(), current),
        ClipPosition::After => (current, clip_path.as_path()),
    };
    let joined = ctx.transcoder.concat(first, second, &output).await;
    if fresh {
        sc.area.release(&clip_path);
    }
    joined.map(|()| output)
}

async fn stage_clip(ctx: &EngineContext, sc: &StepContext<'_>, url: &str, index: usize) -> Result<PathBuf> {
    let path = sc
        .area
        .file(&format!("step{index}-clip"), &url_extension(url, "mp4"));
    ctx.store.stage(url, &path).await?;
    Ok(path)
}
