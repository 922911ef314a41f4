//! Durable key-value store.

use crate::error::{StorageError, StorageResult};
use duckdb::{params, Connection, OptionalExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Well-known keys used by the sync engine.
pub mod keys {
    pub const CREDENTIALS: &str = "cloud_credentials";
    pub const KEY_DATA: &str = "encryption_key_data";
    pub const SYNC_QUEUE: &str = "sync_queue";
    pub const SYNC_STATE: &str = "sync_state";
    pub const DEVICE_ID: &str = "device_id";
    pub const SYNCED_IDS: &str = "synced_session_ids";
    pub const SAVED_SESSIONS: &str = "saved_sessions";
}

/// Byte-oriented durable key-value store.
///
/// Writes must be durable across restarts once `set`/`remove` return.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;
    fn set(&self, key: &str, value: &[u8]) -> StorageResult<()>;
    fn remove(&self, key: &str) -> StorageResult<()>;
}

/// Typed JSON helpers over any [`KvStore`].
pub trait KvStoreExt: KvStore {
    fn get_json<T: DeserializeOwned>(&self, key: &str) -> StorageResult<Option<T>> {
        match self.get(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn set_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> StorageResult<()> {
        let bytes = serde_json::to_vec(value)?;
        self.set(key, &bytes)
    }
}

impl<S: KvStore + ?Sized> KvStoreExt for S {}

// ============================================================================
// MemoryKvStore
// ============================================================================

/// In-process store. Not durable; for tests and ephemeral hosts.
#[derive(Default)]
pub struct MemoryKvStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let entries = self.entries.lock().map_err(|_| StorageError::Poisoned)?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        let mut entries = self.entries.lock().map_err(|_| StorageError::Poisoned)?;
        entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        let mut entries = self.entries.lock().map_err(|_| StorageError::Poisoned)?;
        entries.remove(key);
        Ok(())
    }
}

// ============================================================================
// DuckDbKvStore
// ============================================================================

/// DuckDB-backed store: one `kv_store` table, value as BLOB.
pub struct DuckDbKvStore {
    conn: Arc<Mutex<Connection>>,
}

impl DuckDbKvStore {
    /// Open a store backed by a DuckDB file (`:memory:` for in-memory).
    pub fn open(db_path: &Path) -> StorageResult<Self> {
        let conn = if db_path.to_str() == Some(":memory:") {
            Connection::open_in_memory()?
        } else {
            crate::open_duckdb_with_wal_recovery(db_path, "64MB", 1)?
        };

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.ensure_tables()?;
        Ok(store)
    }

    /// Open with an existing shared connection.
    pub fn open_with_conn(conn: Arc<Mutex<Connection>>) -> StorageResult<Self> {
        let store = Self { conn };
        store.ensure_tables()?;
        Ok(store)
    }

    pub fn open_in_memory() -> StorageResult<Self> {
        Self::open(Path::new(":memory:"))
    }

    fn ensure_tables(&self) -> StorageResult<()> {
        let conn = self.conn.lock().map_err(|_| StorageError::Poisoned)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv_store (
                key VARCHAR PRIMARY KEY,
                value BLOB NOT NULL,
                updated_at BIGINT NOT NULL
            );",
        )?;
        Ok(())
    }
}

impl KvStore for DuckDbKvStore {
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let conn = self.conn.lock().map_err(|_| StorageError::Poisoned)?;
        let value = conn
            .query_row(
                "SELECT value FROM kv_store WHERE key = ?",
                params![key],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        let conn = self.conn.lock().map_err(|_| StorageError::Poisoned)?;
        let now = chrono::Utc::now().timestamp_millis();
        conn.execute(
            "INSERT OR REPLACE INTO kv_store (key, value, updated_at) VALUES (?, ?, ?)",
            params![key, value, now],
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        let conn = self.conn.lock().map_err(|_| StorageError::Poisoned)?;
        conn.execute("DELETE FROM kv_store WHERE key = ?", params![key])?;
        Ok(())
    }
}
