//! Application configuration types.
//!
//! The top-level [`Config`] struct is deserialized from JSON and carries all
//! sub-configs for the engine, the external collaborators and local tools.
//! Every section defaults sensibly so a completely empty `{}` file is valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;
use crate::Error;

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub engine: EngineConfig,
    pub resolver: ResolverConfig,
    pub generation: GenerationConfig,
    pub storage: StorageConfig,
    pub tools: ToolsConfig,
}

impl Config {
    /// Deserialize a `Config` from a JSON string.
    pub fn from_json(json_str: &str) -> Result<Self> {
        serde_json::from_str(json_str)
            .map_err(|e| Error::Validation(format!("config parse error: {e}")))
    }

    /// Load configuration from a file path, falling back to defaults if the
    /// path is `None` or the file does not exist.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };

        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_json(&contents).unwrap_or_else(|e| {
                tracing::warn!("Failed to parse config file {}: {e}", path.display());
                Self::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No config file at {}; using defaults", path.display());
                Self::default()
            }
            Err(e) => {
                tracing::warn!("Failed to read config file {}: {e}", path.display());
                Self::default()
            }
        }
    }

    /// Return a list of validation warnings (non-fatal issues).
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.resolver.max_attempts == 0 {
            warnings.push("resolver.max_attempts is 0; treated as 1".into());
        }
        if self.resolver.base_url.is_none() {
            warnings.push("resolver.base_url is not set; external sources cannot be resolved".into());
        }
        if self.resolver.requests_per_second == 0 {
            warnings.push("resolver.requests_per_second is 0; treated as 1".into());
        }

        if self.generation.api_key.is_none() {
            warnings.push("generation.api_key is not set".into());
        }
        if self.generation.poll_interval_ms == 0 {
            warnings.push("generation.poll_interval_ms is 0; the provider will be polled in a tight loop".into());
        }

        match self.storage.backend {
            StorageBackend::Http => {
                if self.storage.upload_url.is_none() {
                    warnings.push("storage.backend is http but storage.upload_url is not set".into());
                }
                if self.storage.public_url.is_none() {
                    warnings.push("storage.backend is http but storage.public_url is not set".into());
                }
            }
            StorageBackend::Local => {}
        }

        if self.engine.max_concurrent_jobs == Some(0) {
            warnings.push("engine.max_concurrent_jobs is 0; treated as unbounded".into());
        }
        if self.engine.worker_max_in_flight == Some(0) {
            warnings.push("engine.worker_max_in_flight is 0; treated as unbounded".into());
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Sub-configs
// ---------------------------------------------------------------------------

/// Job runner and worker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub db_path: PathBuf,
    /// Root of the per-process scratch area for local artifacts.
    pub scratch_dir: PathBuf,
    /// A job in `processing` for longer than this is reported as stuck.
    pub stuck_after_secs: u64,
    /// Cap on concurrently running children of one batch (unbounded if unset).
    pub max_concurrent_jobs: Option<usize>,
    /// Cap on batches and standalone jobs the worker runs at once (unbounded
    /// if unset).
    pub worker_max_in_flight: Option<usize>,
    /// Worker idle sleep between queue polls.
    pub poll_interval_secs: u64,
    /// Scratch directories older than this are removed by the scratch sweep.
    pub scratch_max_age_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/clipforge.db"),
            scratch_dir: std::env::temp_dir().join("clipforge"),
            stuck_after_secs: 600,
            max_concurrent_jobs: None,
            worker_max_in_flight: None,
            poll_interval_secs: 2,
            scratch_max_age_secs: 86_400,
        }
    }
}

impl EngineConfig {
    pub fn stuck_after(&self) -> Duration {
        Duration::from_secs(self.stuck_after_secs)
    }
}

/// External video/image lookup service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub api_key_header: String,
    pub max_attempts: u32,
    /// First backoff delay; doubles on every further attempt.
    pub base_delay_ms: u64,
    pub requests_per_second: u32,
    pub timeout_secs: u64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            api_key_header: "x-api-key".into(),
            max_attempts: 3,
            base_delay_ms: 1000,
            requests_per_second: 2,
            timeout_secs: 30,
        }
    }
}

/// Asynchronous generation provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub poll_interval_ms: u64,
    /// Upper bound on how long a single request is awaited.
    pub timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            base_url: "https://queue.fal.run".into(),
            api_key: None,
            poll_interval_ms: 2000,
            timeout_secs: 1800,
        }
    }
}

/// Durable object store backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Objects are files under `local_root`, addressed by `file://` URLs.
    #[default]
    Local,
    /// Objects are uploaded with HTTP `PUT` and served from `public_url`.
    Http,
}

/// Durable object store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub local_root: PathBuf,
    pub upload_url: Option<String>,
    pub public_url: Option<String>,
    pub token: Option<String>,
    pub key_prefix: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Local,
            local_root: PathBuf::from("./data/objects"),
            upload_url: None,
            public_url: None,
            token: None,
            key_prefix: "pipeline".into(),
        }
    }
}

/// External tool path overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub ffmpeg_path: Option<PathBuf>,
    pub ffprobe_path: Option<PathBuf>,
    pub timeout_secs: u64,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: None,
            ffprobe_path: None,
            timeout_secs: 600,
        }
    }
}
