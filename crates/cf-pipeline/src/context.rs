//! Shared engine context.
//!
//! [`EngineContext`] bundles the immutable infrastructure every engine
//! operation needs. It is cheap to clone (everything is behind an `Arc` or is
//! itself a handle) so each concurrently running job owns its own copy.

use std::sync::Arc;

use cf_av::{FfmpegTranscoder, Scratch, ToolRegistry, Transcoder};
use cf_core::config::Config;
use cf_core::events::EventBus;
use cf_core::Result;
use cf_db::DbPool;
use cf_remote::{
    build_object_store, GenerationProvider, HttpGenerationProvider, HttpSourceLookup,
    ObjectStore, Resolver,
};

/// Handles shared by the job runner, the batch coordinator and the worker.
#[derive(Clone)]
pub struct EngineContext {
    /// SQLite connection pool.
    pub db: DbPool,
    /// Durable object store for staging and publishing artifacts.
    pub store: Arc<dyn ObjectStore>,
    /// Asynchronous generation provider.
    pub generator: Arc<dyn GenerationProvider>,
    /// Rate-limited, retrying source resolver.
    pub resolver: Arc<Resolver>,
    /// Local media operations.
    pub transcoder: Arc<dyn Transcoder>,
    /// Root of per-job scratch areas.
    pub scratch: Scratch,
    /// Best-effort progress events.
    pub events: Arc<EventBus>,
    pub config: Arc<Config>,
}

impl EngineContext {
    /// Build the production context: SQLite at `engine.db_path`, the
    /// configured object store, the HTTP generation provider and source
    /// lookup, and an ffmpeg transcoder over discovered tools.
    pub fn from_config(config: Config) -> Result<Self> {
        let db = cf_db::init_pool(&config.engine.db_path)?;
        let store = build_object_store(&config.storage)?;
        let generator = Arc::new(HttpGenerationProvider::new(&config.generation)?);
        let lookup = Arc::new(HttpSourceLookup::new(&config.resolver)?);
        let resolver = Arc::new(Resolver::new(lookup, &config.resolver));
        let tools = Arc::new(ToolRegistry::discover(&config.tools));
        let scratch = Scratch::new(&config.engine.scratch_dir)?;

        Ok(Self {
            db,
            store,
            generator,
            resolver,
            transcoder: Arc::new(FfmpegTranscoder::new(tools)),
            scratch,
            events: Arc::new(EventBus::default()),
            config: Arc::new(config),
        })
    }

    /// Run `f` against a pooled connection.
    ///
    /// The connection is returned to the pool before this returns, so it is
    /// never held across an `.await`.
    pub fn with_conn<T>(&self, f: impl FnOnce(&rusqlite::Connection) -> Result<T>) -> Result<T> {
        let conn = cf_db::get_conn(&self.db)?;
        f(&conn)
    }
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("scratch", &self.scratch)
            .finish_non_exhaustive()
    }
}
