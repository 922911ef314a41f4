//! Local durable storage for TabSync.
//!
//! Two stores back the sync engine on each device:
//!
//! - [`KvStore`]: an at-least-once durable key-value store holding
//!   encrypted credentials, key data, the retry queue, sync state, the
//!   device id and the synced-ids cache.
//! - [`SessionStore`]: the user's saved tab sessions, which the engine
//!   reads when pushing and writes when pulling.
//!
//! Both come with an in-memory implementation and a DuckDB-backed one.

mod error;
mod kv_store;
mod session_store;

pub use error::{StorageError, StorageResult};
pub use kv_store::{keys, DuckDbKvStore, KvStore, KvStoreExt, MemoryKvStore};
pub use session_store::{KvSessionStore, SavedSession, SessionStore, Tab};

/// Open a DuckDB connection with stale WAL recovery and resource limits.
///
/// If the initial open fails and a `.wal` file exists alongside the database,
/// it is removed and the open is retried once. This handles the common case
/// where an unclean shutdown leaves a WAL file that prevents reopening.
pub fn open_duckdb_with_wal_recovery(
    path: &std::path::Path,
    memory_limit: &str,
    threads: u32,
) -> StorageResult<duckdb::Connection> {
    let conn = match duckdb::Connection::open(path) {
        Ok(c) => c,
        Err(first_err) => {
            let wal_path = path.with_extension(
                path.extension()
                    .map(|ext| format!("{}.wal", ext.to_string_lossy()))
                    .unwrap_or_else(|| "wal".to_string()),
            );
            if wal_path.exists() {
                tracing::warn!(
                    "DuckDB open failed, removing stale WAL and retrying: {}",
                    wal_path.display()
                );
                if std::fs::remove_file(&wal_path).is_ok() {
                    let c = duckdb::Connection::open(path)?;
                    apply_resource_limits(&c, memory_limit, threads)?;
                    return Ok(c);
                }
            }
            return Err(first_err.into());
        }
    };
    apply_resource_limits(&conn, memory_limit, threads)?;
    Ok(conn)
}

fn apply_resource_limits(
    conn: &duckdb::Connection,
    memory_limit: &str,
    threads: u32,
) -> StorageResult<()> {
    conn.execute_batch(&format!(
        "PRAGMA memory_limit='{}'; PRAGMA threads={};",
        memory_limit, threads
    ))?;
    Ok(())
}
