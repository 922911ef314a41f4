//! Sync manifest bookkeeping and remote naming.

use crate::types::{SyncManifest, SyncSessionMeta, SyncTombstone};
use std::collections::{BTreeSet, HashMap};
use tabsync_crypto::compute_checksum;
use tabsync_storage::SavedSession;

pub const MANIFEST_VERSION: u32 = 1;

/// Encrypted manifest blob.
pub const MANIFEST_BLOB_NAME: &str = "manifest.json.enc";

/// Plaintext key data published so other devices can join.
pub const KEY_DATA_BLOB_NAME: &str = "keydata.json";

/// Remote blob name for a session's encrypted body.
pub fn session_blob_name(session_id: &str) -> String {
    format!("session-{session_id}.json.enc")
}

impl SyncManifest {
    pub fn empty(device_id: &str) -> Self {
        Self {
            version: MANIFEST_VERSION,
            last_sync: 0,
            device_id: device_id.to_string(),
            sessions: Vec::new(),
            tombstones: Vec::new(),
        }
    }

    /// Collapses duplicate session and tombstone ids, keeping the newest.
    pub fn normalize(&mut self) {
        let mut newest: HashMap<String, SyncSessionMeta> = HashMap::new();
        for meta in self.sessions.drain(..) {
            match newest.get(&meta.id) {
                Some(existing) if existing.updated_at >= meta.updated_at => {}
                _ => {
                    newest.insert(meta.id.clone(), meta);
                }
            }
        }
        let mut sessions: Vec<SyncSessionMeta> = newest.into_values().collect();
        sessions.sort_by(|a, b| a.id.cmp(&b.id));
        self.sessions = sessions;

        let mut tombs: HashMap<String, SyncTombstone> = HashMap::new();
        for t in self.tombstones.drain(..) {
            match tombs.get(&t.id) {
                Some(existing) if existing.deleted_at >= t.deleted_at => {}
                _ => {
                    tombs.insert(t.id.clone(), t);
                }
            }
        }
        let mut tombstones: Vec<SyncTombstone> = tombs.into_values().collect();
        tombstones.sort_by(|a, b| a.id.cmp(&b.id));
        self.tombstones = tombstones;
    }

    /// Drops tombstones older than `retention_ms`. Returns how many went.
    pub fn prune_tombstones(&mut self, now: i64, retention_ms: i64) -> usize {
        let cutoff = now - retention_ms;
        let before = self.tombstones.len();
        self.tombstones.retain(|t| t.deleted_at >= cutoff);
        before - self.tombstones.len()
    }

    pub fn session(&self, id: &str) -> Option<&SyncSessionMeta> {
        self.sessions.iter().find(|m| m.id == id)
    }

    pub fn upsert_session(&mut self, meta: SyncSessionMeta) {
        match self.sessions.iter_mut().find(|m| m.id == meta.id) {
            Some(existing) => *existing = meta,
            None => self.sessions.push(meta),
        }
    }

    pub fn remove_session(&mut self, id: &str) -> Option<SyncSessionMeta> {
        let pos = self.sessions.iter().position(|m| m.id == id)?;
        Some(self.sessions.remove(pos))
    }

    pub fn is_tombstoned(&self, id: &str) -> bool {
        self.tombstones.iter().any(|t| t.id == id)
    }

    /// Records a deletion and removes any metadata for `id`.
    pub fn add_tombstone(&mut self, id: &str, deleted_at: i64) {
        self.remove_session(id);
        self.tombstones.retain(|t| t.id != id);
        self.tombstones.push(SyncTombstone {
            id: id.to_string(),
            deleted_at,
        });
    }

    pub fn session_ids(&self) -> BTreeSet<String> {
        self.sessions.iter().map(|m| m.id.clone()).collect()
    }
}

/// Builds manifest metadata for a session from its plaintext JSON.
pub fn session_meta(session: &SavedSession, plaintext: &[u8]) -> SyncSessionMeta {
    SyncSessionMeta {
        id: session.id.clone(),
        name: session.name.clone(),
        updated_at: session.updated_at,
        tab_count: session.tab_count() as u32,
        checksum: compute_checksum(plaintext),
    }
}
