//! cf-db: database access and persistence layer.
//!
//! SQLite-backed storage with connection pooling, embedded migrations, typed
//! models and query modules for jobs, batches and stored reference images.
//! Update operations are partial merges: a field left as `None` in an update
//! struct keeps its stored value.

pub mod migrations;
pub mod models;
pub mod pool;
pub mod queries;

pub use pool::{get_conn, init_memory_pool, init_pool, DbPool, PooledConnection};
