//! cf-remote: the network-facing collaborators of the pipeline engine.
//!
//! - [`storage`] -- durable object store: `stage` (download any URL to a local
//!   path) and `publish` (upload a local file, get its durable URL).
//! - [`generation`] -- asynchronous generation provider: `submit`,
//!   `await_completion`, `fetch_result`.
//! - [`resolver`] -- external source lookup plus the rate-limited,
//!   retrying [`Resolver`] in front of it.
//!
//! Each collaborator is a trait with an HTTP implementation so the engine can
//! be driven by in-process fakes in tests.

pub mod generation;
pub mod resolver;
pub mod storage;

pub use generation::{GenerationProvider, HttpGenerationProvider};
pub use resolver::{HttpSourceLookup, Resolver, SourceLookup};
pub use storage::{build_object_store, HttpObjectStore, LocalObjectStore, ObjectStore};

/// Build a reqwest client with a request timeout.
pub(crate) fn http_client(timeout: std::time::Duration) -> cf_core::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| cf_core::Error::Internal(format!("failed to build HTTP client: {e}")))
}
