//! SQLite connection pooling.
//!
//! Every engine operation borrows a connection for one synchronous call and
//! hands it back before the next `.await`, so the pool only needs to cover
//! the writes that batch children and worker tasks issue at the same moment.
//! Concurrent writers queue on the busy timeout instead of failing.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use cf_core::{Error, Result};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;

use crate::migrations;

pub type DbPool = Pool<SqliteConnectionManager>;
pub type PooledConnection = r2d2::PooledConnection<SqliteConnectionManager>;

/// Connections held by the on-disk pool.
const FILE_POOL_SIZE: u32 = 8;
/// Connections held by an in-memory pool.
const MEMORY_POOL_SIZE: u32 = 4;

/// Milliseconds a writer waits on a locked database before giving up.
const BUSY_TIMEOUT_MS: u32 = 5000;

/// Open the job database at `db_path`, creating the file and its parent
/// directory on first use, and bring the schema up to date.
///
/// Connections run in WAL mode so progress readers never block the runner's
/// checkpoint writes.
pub fn init_pool(db_path: impl AsRef<Path>) -> Result<DbPool> {
    let db_path = db_path.as_ref();
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
        conn.execute_batch(&format!(
            "PRAGMA foreign_keys = ON;
             PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = {BUSY_TIMEOUT_MS};"
        ))
    });

    let pool = build(manager, FILE_POOL_SIZE)?;
    tracing::debug!(path = %db_path.display(), "Job database ready");
    Ok(pool)
}

/// A private in-memory job database.
///
/// Each call gets its own shared-cache database name: connections of one
/// pool see the same jobs and batches, separate pools see nothing of each
/// other.
pub fn init_memory_pool() -> Result<DbPool> {
    static NEXT_DB: AtomicU64 = AtomicU64::new(0);
    let n = NEXT_DB.fetch_add(1, Ordering::Relaxed);
    let uri = format!("file:cf_memdb_{n}?mode=memory&cache=shared");

    let manager = SqliteConnectionManager::file(uri)
        .with_init(|conn| conn.execute_batch("PRAGMA foreign_keys = ON;"));

    build(manager, MEMORY_POOL_SIZE)
}

/// Build the pool and migrate through its first connection. For in-memory
/// pools the idle connections the builder keeps open are what keeps the
/// database alive.
fn build(manager: SqliteConnectionManager, size: u32) -> Result<DbPool> {
    let pool = Pool::builder()
        .max_size(size)
        .build(manager)
        .map_err(|e| Error::database(format!("cannot open job database: {e}")))?;

    migrations::run_migrations(&*get_conn(&pool)?)?;
    Ok(pool)
}

/// Borrow a connection, mapping pool exhaustion to [`Error::Database`].
pub fn get_conn(pool: &DbPool) -> Result<PooledConnection> {
    pool.get()
        .map_err(|e| Error::database(format!("no database connection available: {e}")))
}
