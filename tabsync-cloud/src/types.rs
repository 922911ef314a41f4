//! Shared types for cloud sync operations.
//!
//! Everything written to the blob store or the local store uses camelCase
//! field names; timestamps on the wire are Unix milliseconds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tabsync_crypto::EncryptedPayload;

/// Current wall-clock time in Unix milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// OAuth access/refresh token pair.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub scope: String,
}

impl CloudTokens {
    /// Returns true if the tokens will expire within the given seconds.
    pub fn expires_within_secs(&self, secs: i64) -> bool {
        Utc::now() + chrono::Duration::seconds(secs) >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

impl fmt::Debug for CloudTokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloudTokens")
            .field("access_token", &"[redacted]")
            .field("refresh_token", &"[redacted]")
            .field("expires_at", &self.expires_at)
            .field("scope", &self.scope)
            .finish()
    }
}

/// Encrypted-at-rest wrapper around [`CloudTokens`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudCredentials {
    pub provider: String,
    pub encrypted_tokens: EncryptedPayload,
    pub email: String,
    pub connected_at: DateTime<Utc>,
}

/// Remote-visible metadata for one synced session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSessionMeta {
    pub id: String,
    pub name: String,
    pub updated_at: i64,
    pub tab_count: u32,
    /// Checksum over the plaintext session JSON.
    pub checksum: String,
}

/// Deletion marker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncTombstone {
    pub id: String,
    pub deleted_at: i64,
}

/// The single authoritative remote index, replaced wholesale on every write.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncManifest {
    pub version: u32,
    pub last_sync: i64,
    pub device_id: String,
    #[serde(default)]
    pub sessions: Vec<SyncSessionMeta>,
    #[serde(default)]
    pub tombstones: Vec<SyncTombstone>,
}

/// Queued operation kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueOperation {
    Upload,
    Delete,
}

impl fmt::Display for QueueOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueOperation::Upload => f.write_str("upload"),
            QueueOperation::Delete => f.write_str("delete"),
        }
    }
}

/// A pending per-session operation awaiting retry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncQueueItem {
    pub id: String,
    #[serde(rename = "type")]
    pub operation: QueueOperation,
    pub session_id: String,
    pub queued_at: i64,
    pub retry_count: u32,
    pub next_retry_at: i64,
    #[serde(default)]
    pub last_error: Option<String>,
}

/// Phase of a sync cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncPhase {
    Idle,
    Fetching,
    Uploading,
    Downloading,
    ReconcilingDeletes,
    Finalizing,
}

/// UI-facing sync status.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub syncing: bool,
    pub last_sync_at: Option<i64>,
    pub last_error: Option<String>,
    pub pending_count: usize,
    pub current_operation: Option<SyncPhase>,
}

/// Aggregate outcome of a full sync or queue drain.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub success: bool,
    pub uploaded: usize,
    pub downloaded: usize,
    pub deleted: usize,
    /// Queue items that succeeded on retry during this run.
    pub retried: usize,
    /// Queue items dropped after exhausting their retries.
    pub dropped: usize,
    pub errors: Vec<String>,
    pub first_error: Option<String>,
}

impl SyncReport {
    pub(crate) fn record_error(&mut self, message: String) {
        if self.first_error.is_none() {
            self.first_error = Some(message.clone());
        }
        self.errors.push(message);
    }

    pub(crate) fn finish(mut self) -> Self {
        self.success = self.errors.is_empty();
        self
    }
}

/// Outcome of a single-item push or delete.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PushOutcome {
    Uploaded,
    Deleted,
    /// Remote copy is as new or newer; nothing written.
    Unchanged,
    /// A remote tombstone won; the local copy was removed.
    Tombstoned,
    /// Could not run now; durably queued for retry.
    Queued,
}

/// Whether a freshly connected account still needs encryption set up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EncryptionStatus {
    /// No key data in the remote namespace: call `complete_setup`.
    NeedsSetup,
    /// Another device already set up encryption: call `complete_join`.
    NeedsPassword,
}

/// Result of the interactive connect step.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectOutcome {
    pub email: String,
    pub encryption: EncryptionStatus,
}

/// Events broadcast by the engine.
#[derive(Clone, Debug)]
pub enum SyncEvent {
    StateChanged(SyncState),
    SyncCompleted(SyncReport),
    /// A queued item exhausted its retries and was removed.
    QueueItemDropped {
        session_id: String,
        operation: QueueOperation,
        last_error: Option<String>,
    },
}

/// Commands sent to the sync scheduler.
#[derive(Debug)]
pub enum SyncCommand {
    SyncNow,
    PushSession { session_id: String },
    DeleteSession { session_id: String },
    ProcessQueue,
    Stop,
}
