//! Shared test harness for integration tests.
//!
//! Provides [`TestHarness`], a full [`EngineContext`] backed by an in-memory
//! DB, a local object store in a temp dir, and in-process fakes for the
//! source lookup, the generation provider and the transcoder. Every fake
//! counts its calls. Media files are short byte strings; each fake transcode
//! appends a marker so the final output records which operations ran.
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;

use cf_av::{AudioMix, Scratch, Transcoder};
use cf_core::config::{Config, ResolverConfig};
use cf_core::events::EventBus;
use cf_core::{
    AudioMode, ClipConfig, ClipPosition, Error, GenerateConfig, JobId, MusicConfig, PipelineStep,
    ProgressSender, ReferenceImage, Result, SourceRef, StepConfig, StepId, TextOverlay,
    TextPosition,
};
use cf_db::models::Job;
use cf_db::queries::jobs::{self, NewJob};
use cf_db::{init_memory_pool, DbPool, PooledConnection};
use cf_pipeline::EngineContext;
use cf_remote::storage::{file_url, local_path};
use cf_remote::{GenerationProvider, LocalObjectStore, Resolver, SourceLookup};

pub const SOURCE_BYTES: &[u8] = b"SOURCE";
pub const GENERATED_BYTES: &[u8] = b"GEN";
pub const CLIP_BYTES: &[u8] = b"CLIP";
pub const TRACK_BYTES: &[u8] = b"TRACK";

/// Endpoints starting with this prefix reject every submission.
pub const BROKEN_ENDPOINT: &str = "broken/model";

/// Requests to endpoints starting with this prefix take [`SLOW_DELAY`] to
/// complete.
pub const SLOW_ENDPOINT: &str = "slow/model";
pub const SLOW_DELAY: Duration = Duration::from_millis(300);

/// Callback run inside `submit` with the endpoint.
pub type SubmitHook = Box<dyn Fn(&str) + Send + Sync>;

// ---------------------------------------------------------------------------
// Fake source lookup
// ---------------------------------------------------------------------------

/// Resolves every reference to the fixture source video, or fails as
/// configured.
pub struct FakeLookup {
    pub calls: AtomicUsize,
    target: String,
    failure: Mutex<Option<bool>>,
}

impl FakeLookup {
    /// Make every further lookup fail with the given retryability.
    pub fn fail(&self, retryable: bool) {
        *self.failure.lock() = Some(retryable);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceLookup for FakeLookup {
    async fn lookup(&self, reference: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match *self.failure.lock() {
            Some(retryable) => Err(Error::resolution(retryable, format!("no media at {reference}"))),
            None => Ok(self.target.clone()),
        }
    }
}

// ---------------------------------------------------------------------------
// Fake generation provider
// ---------------------------------------------------------------------------

/// Accepts every submission (except to [`BROKEN_ENDPOINT`]) and completes it
/// immediately with the fixture generated video.
pub struct FakeGenerator {
    pub submits: AtomicUsize,
    pub awaits: AtomicUsize,
    pub fetches: AtomicUsize,
    pub inputs: Mutex<Vec<serde_json::Value>>,
    /// Requests currently inside `await_completion`, and the most seen at once.
    pub in_flight: AtomicUsize,
    pub peak_in_flight: AtomicUsize,
    pub on_submit: Mutex<Option<SubmitHook>>,
    result_url: String,
}

impl FakeGenerator {
    pub fn submits(&self) -> usize {
        self.submits.load(Ordering::SeqCst)
    }

    pub fn awaits(&self) -> usize {
        self.awaits.load(Ordering::SeqCst)
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn set_on_submit(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        *self.on_submit.lock() = Some(Box::new(hook));
    }
}

#[async_trait]
impl GenerationProvider for FakeGenerator {
    async fn submit(&self, endpoint: &str, input: &serde_json::Value) -> Result<String> {
        if endpoint.starts_with(BROKEN_ENDPOINT) {
            return Err(Error::Generation(format!("{endpoint} rejected the request")));
        }
        let n = self.submits.fetch_add(1, Ordering::SeqCst) + 1;
        self.inputs.lock().push(input.clone());
        if let Some(hook) = self.on_submit.lock().as_ref() {
            hook(endpoint);
        }
        Ok(format!("req-{n}"))
    }

    async fn await_completion(
        &self,
        endpoint: &str,
        _request_id: &str,
        progress: &ProgressSender,
    ) -> Result<()> {
        self.awaits.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        progress.send("IN_QUEUE (position 1)");
        if endpoint.starts_with(SLOW_ENDPOINT) {
            tokio::time::sleep(SLOW_DELAY).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        progress.send("COMPLETED");
        Ok(())
    }

    async fn fetch_result(&self, _endpoint: &str, _request_id: &str) -> Result<String> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.result_url.clone())
    }
}

// ---------------------------------------------------------------------------
// Fake transcoder
// ---------------------------------------------------------------------------

/// Writes `input + marker` for every operation and records the operation
/// names in call order.
#[derive(Default)]
pub struct FakeTranscoder {
    pub ops: Mutex<Vec<String>>,
}

impl FakeTranscoder {
    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().clone()
    }

    fn derive(&self, op: &str, input: &Path, output: &Path, marker: &str) -> Result<()> {
        self.ops.lock().push(op.to_string());
        let mut bytes = std::fs::read(input)?;
        bytes.extend_from_slice(marker.as_bytes());
        std::fs::write(output, bytes)?;
        Ok(())
    }
}

#[async_trait]
impl Transcoder for FakeTranscoder {
    async fn overlay_text(&self, input: &Path, output: &Path, _overlay: &TextOverlay) -> Result<()> {
        self.derive("overlay", input, output, "|overlay")
    }

    async fn mix_audio(&self, video: &Path, track: &Path, output: &Path, mix: &AudioMix) -> Result<()> {
        if std::fs::read(track)? != TRACK_BYTES {
            return Err(Error::transcode("ffmpeg", "unexpected track contents"));
        }
        let marker = match mix.mode {
            AudioMode::Mix => "|mix",
            AudioMode::Replace => "|replace",
        };
        self.derive("mix", video, output, marker)
    }

    async fn concat(&self, first: &Path, second: &Path, output: &Path) -> Result<()> {
        self.ops.lock().push("concat".into());
        let mut bytes = std::fs::read(first)?;
        bytes.push(b'+');
        bytes.extend(std::fs::read(second)?);
        std::fs::write(output, bytes)?;
        Ok(())
    }

    async fn strip_audio(&self, input: &Path, output: &Path) -> Result<()> {
        self.derive("strip", input, output, "|silent")
    }

    async fn trim(&self, input: &Path, output: &Path, _max_secs: f64) -> Result<()> {
        self.derive("trim", input, output, "|trim")
    }
}

// ---------------------------------------------------------------------------
// TestHarness
// ---------------------------------------------------------------------------

/// A full engine context wired to fakes.
pub struct TestHarness {
    pub ctx: EngineContext,
    pub db: DbPool,
    pub lookup: Arc<FakeLookup>,
    pub generator: Arc<FakeGenerator>,
    pub transcoder: Arc<FakeTranscoder>,
    fixtures: TempDir,
    _store: TempDir,
    _scratch: TempDir,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// Build a harness from `config`; resolver delays are shortened so retry
    /// tests run quickly.
    pub fn with_config(mut config: Config) -> Self {
        config.resolver = ResolverConfig {
            max_attempts: 3,
            base_delay_ms: 1,
            requests_per_second: 1000,
            ..config.resolver
        };

        let fixtures = tempfile::tempdir().expect("fixtures dir");
        let store_dir = tempfile::tempdir().expect("store dir");
        let scratch_dir = tempfile::tempdir().expect("scratch dir");

        let write = |name: &str, bytes: &[u8]| -> String {
            let path = fixtures.path().join(name);
            std::fs::write(&path, bytes).expect("write fixture");
            file_url(&std::fs::canonicalize(&path).expect("canonical fixture"))
        };
        let source_url = write("source.mp4", SOURCE_BYTES);
        let generated_url = write("generated.mp4", GENERATED_BYTES);
        write("clip.mp4", CLIP_BYTES);
        write("track.mp3", TRACK_BYTES);

        let lookup = Arc::new(FakeLookup {
            calls: AtomicUsize::new(0),
            target: source_url,
            failure: Mutex::new(None),
        });
        let generator = Arc::new(FakeGenerator {
            submits: AtomicUsize::new(0),
            awaits: AtomicUsize::new(0),
            fetches: AtomicUsize::new(0),
            inputs: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            on_submit: Mutex::new(None),
            result_url: generated_url,
        });
        let transcoder = Arc::new(FakeTranscoder::default());

        let db = init_memory_pool().expect("failed to create in-memory pool");
        let store = LocalObjectStore::new(store_dir.path(), "test").expect("object store");

        let ctx = EngineContext {
            db: db.clone(),
            store: Arc::new(store),
            generator: generator.clone(),
            resolver: Arc::new(Resolver::new(lookup.clone(), &config.resolver)),
            transcoder: transcoder.clone(),
            scratch: Scratch::new(scratch_dir.path()).expect("scratch"),
            events: Arc::new(EventBus::default()),
            config: Arc::new(config),
        };

        Self {
            ctx,
            db,
            lookup,
            generator,
            transcoder,
            fixtures,
            _store: store_dir,
            _scratch: scratch_dir,
        }
    }

    /// Get a connection from the pool.
    pub fn conn(&self) -> PooledConnection {
        self.db.get().expect("failed to get connection from pool")
    }

    /// `file://` URL of a fixture (`source.mp4`, `clip.mp4`, `track.mp3`).
    pub fn fixture_url(&self, name: &str) -> String {
        let path = std::fs::canonicalize(self.fixtures.path().join(name)).expect("fixture exists");
        file_url(&path)
    }

    /// Publish `bytes` to the object store as if an earlier run had.
    pub async fn publish_bytes(&self, bytes: &[u8]) -> String {
        let path = self.fixtures.path().join(format!("{}.mp4", next_artifact_name()));
        std::fs::write(&path, bytes).expect("write artifact");
        self.ctx.store.publish(&path).await.expect("publish")
    }

    /// Insert a standalone job.
    pub fn create_job(&self, steps: Vec<PipelineStep>, source: SourceRef) -> Job {
        jobs::create_job(
            &self.conn(),
            &NewJob {
                steps,
                source,
                batch_id: None,
            },
        )
        .expect("create job")
    }

    pub fn get_job(&self, id: JobId) -> Job {
        jobs::get_job(&self.conn(), id)
            .expect("get job")
            .expect("job exists")
    }

    /// Number of files currently left in the scratch root, recursively.
    pub fn scratch_files(&self) -> usize {
        count_files(self.ctx.scratch.root())
    }
}

/// Contents of the object behind a durable `file://` URL.
pub fn read_url(url: &str) -> Vec<u8> {
    let path = local_path(url).expect("store URLs are file:// URLs");
    std::fs::read(path).expect("object exists")
}

fn count_files(dir: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .map(|p: PathBuf| if p.is_dir() { count_files(&p) } else { 1 })
        .sum()
}

fn next_artifact_name() -> String {
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    format!("artifact-{}", NEXT.fetch_add(1, Ordering::SeqCst))
}

// ---------------------------------------------------------------------------
// Step builders
// ---------------------------------------------------------------------------

pub fn generate_step(id: &str, endpoint: &str) -> PipelineStep {
    PipelineStep {
        id: StepId::from(id),
        enabled: true,
        config: StepConfig::GenerateFromReference(GenerateConfig {
            endpoint: endpoint.into(),
            prompt: Some("swap the face".into()),
            reference_image: Some(ReferenceImage::Url("https://img/face.png".into())),
            requires_input_video: true,
            max_duration_secs: 8.0,
            generate_audio: None,
            resolution: None,
            aspect_ratio: None,
        }),
    }
}

pub fn overlay_step(id: &str) -> PipelineStep {
    PipelineStep {
        id: StepId::from(id),
        enabled: true,
        config: StepConfig::OverlayText(TextOverlay {
            text: "hello".into(),
            font: None,
            font_size: 48,
            color: "white".into(),
            position: TextPosition::Bottom,
            start_secs: None,
            end_secs: None,
            box_color: None,
        }),
    }
}

pub fn music_step(id: &str, track_url: &str, modes: &[(&str, AudioMode)]) -> PipelineStep {
    PipelineStep {
        id: StepId::from(id),
        enabled: true,
        config: StepConfig::MixAudio(MusicConfig {
            track_url: track_url.into(),
            volume: 0.5,
            fade_in_secs: 1.0,
            fade_out_secs: 1.0,
            target_modes: modes
                .iter()
                .map(|(step, mode)| (StepId::from(*step), *mode))
                .collect(),
        }),
    }
}

pub fn clip_step(id: &str, position: ClipPosition, clip: ClipConfig) -> PipelineStep {
    PipelineStep {
        id: StepId::from(id),
        enabled: true,
        config: StepConfig::AttachClip(ClipConfig { position, ..clip }),
    }
}

pub fn disabled(mut step: PipelineStep) -> PipelineStep {
    step.enabled = false;
    step
}
