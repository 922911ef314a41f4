//! Saved tab sessions.

use crate::error::StorageResult;
use crate::kv_store::{keys, KvStore, KvStoreExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// One tab inside a saved session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tab {
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,
}

/// A named collection of tabs saved by the user.
///
/// `updated_at` is wall-clock milliseconds and is what last-write-wins
/// compares across devices.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedSession {
    pub id: String,
    pub name: String,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default)]
    pub tabs: Vec<Tab>,
}

impl SavedSession {
    pub fn tab_count(&self) -> usize {
        self.tabs.len()
    }
}

/// Local saved-session collection the sync engine reads and writes.
pub trait SessionStore: Send + Sync {
    fn list(&self) -> StorageResult<Vec<SavedSession>>;
    fn get(&self, id: &str) -> StorageResult<Option<SavedSession>>;
    /// Inserts or replaces by id.
    fn put(&self, session: &SavedSession) -> StorageResult<()>;
    /// Removes by id. Missing ids are not an error.
    fn delete(&self, id: &str) -> StorageResult<()>;
}

/// Keeps the whole collection as one JSON map under
/// [`keys::SAVED_SESSIONS`].
pub struct KvSessionStore {
    kv: Arc<dyn KvStore>,
    // Serializes read-modify-write of the collection.
    write_lock: Mutex<()>,
}

impl KvSessionStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            write_lock: Mutex::new(()),
        }
    }

    fn load(&self) -> StorageResult<BTreeMap<String, SavedSession>> {
        Ok(self.kv.get_json(keys::SAVED_SESSIONS)?.unwrap_or_default())
    }

    fn save(&self, sessions: &BTreeMap<String, SavedSession>) -> StorageResult<()> {
        self.kv.set_json(keys::SAVED_SESSIONS, sessions)
    }
}

impl SessionStore for KvSessionStore {
    fn list(&self) -> StorageResult<Vec<SavedSession>> {
        Ok(self.load()?.into_values().collect())
    }

    fn get(&self, id: &str) -> StorageResult<Option<SavedSession>> {
        Ok(self.load()?.remove(id))
    }

    fn put(&self, session: &SavedSession) -> StorageResult<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| crate::StorageError::Poisoned)?;
        let mut sessions = self.load()?;
        sessions.insert(session.id.clone(), session.clone());
        self.save(&sessions)
    }

    fn delete(&self, id: &str) -> StorageResult<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| crate::StorageError::Poisoned)?;
        let mut sessions = self.load()?;
        if sessions.remove(id).is_some() {
            self.save(&sessions)?;
        }
        Ok(())
    }
}
