//! Manifest-based sync engine.
//!
//! The remote namespace holds one encrypted manifest plus one encrypted
//! blob per session. Every operation that rewrites the manifest (full
//! sync, single push, single delete, queue drain, re-key) runs under
//! `manifest_lock`. The blob store has no compare-and-swap, so that lock
//! is the only thing keeping two same-device operations from clobbering
//! each other; cross-device races fall back to last-write-wins on
//! `updatedAt` with tombstones beating stale copies.
//!
//! A full cycle walks `Idle -> Fetching -> Uploading -> Downloading ->
//! ReconcilingDeletes -> Finalizing -> Idle`. Per-session failures are
//! collected into the [`SyncReport`]; failing to fetch or write the
//! manifest, or to obtain tokens, aborts the cycle.

use crate::account::PendingConnection;
use crate::blob_store::{BlobStore, BlobStoreError};
use crate::config::SyncConfig;
use crate::error::{CloudError, CloudResult};
use crate::manifest::{session_blob_name, session_meta, MANIFEST_BLOB_NAME};
use crate::oauth::OAuthProvider;
use crate::retry_queue::RetryQueue;
use crate::session::UnlockedSession;
use crate::token_manager::TokenManager;
use crate::types::*;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tabsync_crypto::{decrypt, decrypt_json, encrypt, encrypt_json, EncryptedPayload, EncryptionKeyData};
use tabsync_storage::{keys, KvStore, KvStoreExt, SavedSession, SessionStore};
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, error, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// An unlocked session paired with a currently valid access token.
pub(crate) struct RemoteContext {
    pub(crate) session: Arc<UnlockedSession>,
    pub(crate) access_token: String,
}

pub struct ManifestSyncEngine {
    pub(crate) config: SyncConfig,
    pub(crate) kv: Arc<dyn KvStore>,
    pub(crate) sessions: Arc<dyn SessionStore>,
    pub(crate) blobs: Arc<dyn BlobStore>,
    pub(crate) oauth: Arc<dyn OAuthProvider>,
    pub(crate) tokens: TokenManager,
    queue: RetryQueue,
    /// `manifestLock`: held for every manifest read-modify-write.
    pub(crate) manifest_lock: Mutex<()>,
    pub(crate) session: RwLock<Option<Arc<UnlockedSession>>>,
    pub(crate) pending: Mutex<Option<PendingConnection>>,
    state: RwLock<SyncState>,
    events: broadcast::Sender<SyncEvent>,
    device_id: String,
}

impl ManifestSyncEngine {
    /// Builds an engine over the given stores. The engine starts locked.
    pub fn new(
        config: SyncConfig,
        kv: Arc<dyn KvStore>,
        sessions: Arc<dyn SessionStore>,
        blobs: Arc<dyn BlobStore>,
        oauth: Arc<dyn OAuthProvider>,
    ) -> CloudResult<Self> {
        let device_id = match kv.get_json::<String>(keys::DEVICE_ID)? {
            Some(id) => id,
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                kv.set_json(keys::DEVICE_ID, &id)?;
                info!("generated device id {id}");
                id
            }
        };

        // A crash mid-cycle leaves `syncing` set; clear it.
        let mut state: SyncState = kv.get_json(keys::SYNC_STATE)?.unwrap_or_default();
        state.syncing = false;
        state.current_operation = None;

        let tokens = TokenManager::new(
            oauth.clone(),
            kv.clone(),
            config.token_refresh_margin_secs,
        );
        let queue = RetryQueue::new(kv.clone(), config.retry.clone());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            config,
            kv,
            sessions,
            blobs,
            oauth,
            tokens,
            queue,
            manifest_lock: Mutex::new(()),
            session: RwLock::new(None),
            pending: Mutex::new(None),
            state: RwLock::new(state),
            events,
            device_id,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn queue(&self) -> &RetryQueue {
        &self.queue
    }

    pub async fn sync_state(&self) -> SyncState {
        self.state.read().await.clone()
    }

    pub async fn is_unlocked(&self) -> bool {
        self.session.read().await.is_some()
    }

    pub fn is_connected(&self) -> CloudResult<bool> {
        Ok(self.tokens.load_credentials()?.is_some())
    }

    pub(crate) fn load_key_data(&self) -> CloudResult<Option<EncryptionKeyData>> {
        Ok(self.kv.get_json(keys::KEY_DATA)?)
    }

    /// The current session, or why there is none.
    pub(crate) async fn active_session(&self) -> CloudResult<Arc<UnlockedSession>> {
        if let Some(session) = self.session.read().await.clone() {
            return Ok(session);
        }
        if self.tokens.load_credentials()?.is_none() {
            return Err(CloudError::NotConnected);
        }
        if self.load_key_data()?.is_none() {
            return Err(CloudError::NotConfigured);
        }
        Err(CloudError::Locked)
    }

    pub(crate) async fn remote_context(
        &self,
        session: &Arc<UnlockedSession>,
    ) -> CloudResult<RemoteContext> {
        let tokens = self.tokens.get_valid_tokens(session).await?;
        Ok(RemoteContext {
            session: session.clone(),
            access_token: tokens.access_token,
        })
    }

    // ========================================================================
    // Remote blobs
    // ========================================================================

    async fn download_payload(&self, ctx: &RemoteContext, id: &str) -> CloudResult<EncryptedPayload> {
        let bytes = self.blobs.download(&ctx.access_token, id).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn upload_payload(
        &self,
        ctx: &RemoteContext,
        name: &str,
        payload: &EncryptedPayload,
    ) -> CloudResult<()> {
        let bytes = serde_json::to_vec(payload)?;
        self.blobs.upload(&ctx.access_token, name, bytes, None).await?;
        Ok(())
    }

    /// Fetches and decrypts the manifest, or starts an empty one.
    pub(crate) async fn fetch_manifest(&self, ctx: &RemoteContext) -> CloudResult<SyncManifest> {
        let Some(id) = self
            .blobs
            .find_by_name(&ctx.access_token, MANIFEST_BLOB_NAME, None)
            .await?
        else {
            debug!("no remote manifest, starting empty");
            return Ok(SyncManifest::empty(&self.device_id));
        };

        let payload = self.download_payload(ctx, &id).await?;
        let mut manifest: SyncManifest = decrypt_json(ctx.session.key(), &payload)?;
        manifest.normalize();
        Ok(manifest)
    }

    pub(crate) async fn write_manifest(
        &self,
        ctx: &RemoteContext,
        manifest: &mut SyncManifest,
    ) -> CloudResult<()> {
        manifest.last_sync = now_millis();
        manifest.device_id = self.device_id.clone();
        let payload = encrypt_json(ctx.session.key(), manifest)?;
        self.upload_payload(ctx, MANIFEST_BLOB_NAME, &payload).await
    }

    /// Encrypts and uploads a session; returns its manifest entry.
    pub(crate) async fn upload_session(
        &self,
        ctx: &RemoteContext,
        session: &SavedSession,
    ) -> CloudResult<SyncSessionMeta> {
        let plaintext = serde_json::to_vec(session)?;
        let payload = encrypt(ctx.session.key(), &plaintext)?;
        self.upload_payload(ctx, &session_blob_name(&session.id), &payload)
            .await?;
        Ok(session_meta(session, &plaintext))
    }

    async fn download_session(&self, ctx: &RemoteContext, session_id: &str) -> CloudResult<SavedSession> {
        let name = session_blob_name(session_id);
        let id = self
            .blobs
            .find_by_name(&ctx.access_token, &name, None)
            .await?
            .ok_or_else(|| CloudError::NotFound(name))?;
        let payload = self.download_payload(ctx, &id).await?;
        let plaintext = decrypt(ctx.session.key(), &payload)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }

    /// Deletes a session blob. Already-missing blobs count as deleted.
    async fn delete_remote_session(&self, ctx: &RemoteContext, session_id: &str) -> CloudResult<()> {
        let name = session_blob_name(session_id);
        let Some(id) = self.blobs.find_by_name(&ctx.access_token, &name, None).await? else {
            return Ok(());
        };
        match self.blobs.delete(&ctx.access_token, &id).await {
            Ok(()) | Err(BlobStoreError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    // ========================================================================
    // Local bookkeeping
    // ========================================================================

    pub(crate) fn load_synced_ids(&self) -> CloudResult<BTreeSet<String>> {
        Ok(self.kv.get_json(keys::SYNCED_IDS)?.unwrap_or_default())
    }

    pub(crate) fn save_synced_ids(&self, ids: &BTreeSet<String>) -> CloudResult<()> {
        self.kv.set_json(keys::SYNCED_IDS, ids)?;
        Ok(())
    }

    fn mark_synced(&self, session_id: &str, synced: bool) -> CloudResult<()> {
        let mut ids = self.load_synced_ids()?;
        let changed = if synced {
            ids.insert(session_id.to_string())
        } else {
            ids.remove(session_id)
        };
        if changed {
            self.save_synced_ids(&ids)?;
        }
        Ok(())
    }

    /// Applies `f` to the state, persists it and broadcasts the result.
    pub(crate) async fn update_state<F>(&self, f: F) -> CloudResult<()>
    where
        F: FnOnce(&mut SyncState),
    {
        let snapshot = {
            let mut state = self.state.write().await;
            f(&mut state);
            state.clone()
        };
        self.kv.set_json(keys::SYNC_STATE, &snapshot)?;
        // No receivers is fine.
        let _ = self.events.send(SyncEvent::StateChanged(snapshot));
        Ok(())
    }

    async fn set_phase(&self, phase: SyncPhase) -> CloudResult<()> {
        debug!("sync phase: {phase:?}");
        self.update_state(|s| s.current_operation = Some(phase)).await
    }

    async fn refresh_pending_count(&self) -> CloudResult<()> {
        let pending = self.queue.pending_count().await?;
        self.update_state(|s| s.pending_count = pending).await
    }

    // ========================================================================
    // Full sync
    // ========================================================================

    /// Runs one full reconciliation cycle.
    ///
    /// Refused up front when not connected, not configured or locked.
    pub async fn perform_full_sync(&self) -> CloudResult<SyncReport> {
        let session = self.active_session().await?;
        let _guard = self.manifest_lock.lock().await;

        self.update_state(|s| {
            s.syncing = true;
            s.current_operation = Some(SyncPhase::Fetching);
        })
        .await?;

        let mut result = self.full_sync_locked(&session).await;
        if matches!(&result, Err(e) if e.is_auth()) {
            // The access token can be revoked before it expires.
            warn!("access token rejected, forcing a refresh and retrying once");
            result = match self.tokens.force_refresh(&session).await {
                Ok(_) => self.full_sync_locked(&session).await,
                Err(e) => Err(e),
            };
        }
        let pending = self.queue.pending_count().await.unwrap_or_default();

        match &result {
            Ok(report) => {
                let finished_at = now_millis();
                let last_error = report.first_error.clone();
                self.update_state(|s| {
                    s.syncing = false;
                    s.current_operation = None;
                    s.last_sync_at = Some(finished_at);
                    s.last_error = last_error;
                    s.pending_count = pending;
                })
                .await?;
                info!(
                    "sync complete: {} uploaded, {} downloaded, {} deleted, {} errors",
                    report.uploaded,
                    report.downloaded,
                    report.deleted,
                    report.errors.len()
                );
                let _ = self.events.send(SyncEvent::SyncCompleted(report.clone()));
            }
            Err(e) => {
                error!("sync failed: {e}");
                let message = e.to_string();
                self.update_state(|s| {
                    s.syncing = false;
                    s.current_operation = None;
                    s.last_error = Some(message);
                    s.pending_count = pending;
                })
                .await?;
            }
        }

        result
    }

    pub(crate) async fn full_sync_locked(
        &self,
        session: &Arc<UnlockedSession>,
    ) -> CloudResult<SyncReport> {
        let mut report = SyncReport::default();
        let ctx = self.remote_context(session).await?;

        // 1. Fetch.
        let mut manifest = self.fetch_manifest(&ctx).await?;

        // 2. Prune.
        let now = now_millis();
        let pruned = manifest.prune_tombstones(now, self.config.tombstone_retention_ms());
        if pruned > 0 {
            debug!("pruned {pruned} expired tombstones");
        }

        let local = self.sessions.list()?;
        let local_updated: HashMap<String, i64> =
            local.iter().map(|s| (s.id.clone(), s.updated_at)).collect();
        let synced_ids = self.load_synced_ids()?;
        let locally_deleted: BTreeSet<String> = synced_ids
            .iter()
            .filter(|id| !local_updated.contains_key(*id))
            .cloned()
            .collect();

        // 3. Tombstones win; then push anything newer than the remote copy.
        self.set_phase(SyncPhase::Uploading).await?;
        for session in &local {
            if manifest.is_tombstoned(&session.id) {
                match self.sessions.delete(&session.id) {
                    Ok(()) => {
                        debug!("session {} tombstoned remotely, removed locally", session.id);
                        report.deleted += 1;
                    }
                    Err(e) => report.record_error(format!("delete local {}: {e}", session.id)),
                }
                continue;
            }

            let remote_updated = manifest.session(&session.id).map(|m| m.updated_at);
            if remote_updated.is_some_and(|remote| session.updated_at <= remote) {
                continue;
            }
            match self.upload_session(&ctx, session).await {
                Ok(meta) => {
                    manifest.upsert_session(meta);
                    report.uploaded += 1;
                }
                Err(e) => {
                    warn!("upload of session {} failed: {e}", session.id);
                    report.record_error(format!("upload {}: {e}", session.id));
                }
            }
        }

        // 4. Pull anything newer than the local copy.
        self.set_phase(SyncPhase::Downloading).await?;
        let remote_metas: Vec<SyncSessionMeta> = manifest.sessions.clone();
        for meta in remote_metas {
            if locally_deleted.contains(&meta.id) || manifest.is_tombstoned(&meta.id) {
                continue;
            }
            let newer = match local_updated.get(&meta.id) {
                Some(local_at) => meta.updated_at > *local_at,
                None => true,
            };
            if !newer {
                continue;
            }
            let pulled = match self.download_session(&ctx, &meta.id).await {
                Ok(session) => self.sessions.put(&session).map_err(CloudError::from),
                Err(e) => Err(e),
            };
            match pulled {
                Ok(()) => report.downloaded += 1,
                Err(e) => {
                    warn!("download of session {} failed: {e}", meta.id);
                    report.record_error(format!("download {}: {e}", meta.id));
                }
            }
        }

        // 5. Propagate local deletions.
        self.set_phase(SyncPhase::ReconcilingDeletes).await?;
        let mut pending_deletes = BTreeSet::new();
        for id in &locally_deleted {
            if manifest.is_tombstoned(id) {
                continue;
            }
            match self.delete_remote_session(&ctx, id).await {
                Ok(()) => {
                    manifest.add_tombstone(id, now);
                    report.deleted += 1;
                }
                Err(e) => {
                    warn!("remote delete of session {id} failed, retrying next cycle: {e}");
                    report.record_error(format!("delete remote {id}: {e}"));
                    pending_deletes.insert(id.clone());
                }
            }
        }

        // 6. Write the manifest back.
        self.set_phase(SyncPhase::Finalizing).await?;
        self.write_manifest(&ctx, &mut manifest).await?;

        // 7. Remember what this device has synced. Failed downloads stay out
        // so the next cycle does not mistake them for local deletions; failed
        // remote deletes stay in so the next cycle retries them.
        let present: BTreeSet<String> = self.sessions.list()?.into_iter().map(|s| s.id).collect();
        let mut synced: BTreeSet<String> = manifest
            .session_ids()
            .intersection(&present)
            .cloned()
            .collect();
        synced.extend(pending_deletes);
        self.save_synced_ids(&synced)?;

        // 8. Drain whatever is ready in the retry queue.
        self.drain_queue_locked(session, &mut report).await?;

        // 9.
        Ok(report.finish())
    }

    // ========================================================================
    // Single-item operations
    // ========================================================================

    /// Pushes one session after a local save.
    ///
    /// When locked, or when the attempt fails for any reason, the upload is
    /// queued and [`PushOutcome::Queued`] is returned.
    pub async fn push_session(&self, session_id: &str) -> CloudResult<PushOutcome> {
        self.run_single(QueueOperation::Upload, session_id).await
    }

    /// Deletes one session remotely and writes its tombstone.
    pub async fn delete_session_from_cloud(&self, session_id: &str) -> CloudResult<PushOutcome> {
        self.run_single(QueueOperation::Delete, session_id).await
    }

    async fn run_single(&self, operation: QueueOperation, session_id: &str) -> CloudResult<PushOutcome> {
        let session = match self.active_session().await {
            Ok(session) => session,
            Err(CloudError::Locked) => {
                debug!("engine locked, queueing {operation} for session {session_id}");
                return self.enqueue_single(operation, session_id, None).await;
            }
            Err(e) => return Err(e),
        };

        let _guard = self.manifest_lock.lock().await;
        let result = async {
            let ctx = self.remote_context(&session).await?;
            self.execute_locked(&ctx, operation, session_id).await
        }
        .await;

        match result {
            Ok(outcome) => {
                self.queue.discard(session_id).await?;
                self.refresh_pending_count().await?;
                Ok(outcome)
            }
            Err(e) => {
                if e.is_transient() {
                    warn!("{operation} of session {session_id} failed, queueing: {e}");
                } else {
                    error!("{operation} of session {session_id} failed, queueing: {e}");
                }
                self.enqueue_single(operation, session_id, Some(e.to_string()))
                    .await
            }
        }
    }

    async fn enqueue_single(
        &self,
        operation: QueueOperation,
        session_id: &str,
        error: Option<String>,
    ) -> CloudResult<PushOutcome> {
        self.queue.enqueue(operation, session_id).await?;
        let pending = self.queue.pending_count().await?;
        self.update_state(|s| {
            s.pending_count = pending;
            if error.is_some() {
                s.last_error = error;
            }
        })
        .await?;
        Ok(PushOutcome::Queued)
    }

    async fn execute_locked(
        &self,
        ctx: &RemoteContext,
        operation: QueueOperation,
        session_id: &str,
    ) -> CloudResult<PushOutcome> {
        match operation {
            QueueOperation::Upload => self.push_locked(ctx, session_id).await,
            QueueOperation::Delete => self.delete_locked(ctx, session_id).await,
        }
    }

    async fn push_locked(&self, ctx: &RemoteContext, session_id: &str) -> CloudResult<PushOutcome> {
        let mut manifest = self.fetch_manifest(ctx).await?;

        if manifest.is_tombstoned(session_id) {
            self.sessions.delete(session_id)?;
            self.mark_synced(session_id, false)?;
            info!("session {session_id} was deleted on another device, removed locally");
            return Ok(PushOutcome::Tombstoned);
        }

        let Some(local) = self.sessions.get(session_id)? else {
            debug!("session {session_id} no longer exists locally, nothing to push");
            return Ok(PushOutcome::Unchanged);
        };
        if manifest
            .session(session_id)
            .is_some_and(|remote| remote.updated_at >= local.updated_at)
        {
            return Ok(PushOutcome::Unchanged);
        }

        let meta = self.upload_session(ctx, &local).await?;
        manifest.upsert_session(meta);
        self.write_manifest(ctx, &mut manifest).await?;
        self.mark_synced(session_id, true)?;
        debug!("pushed session {session_id}");
        Ok(PushOutcome::Uploaded)
    }

    async fn delete_locked(&self, ctx: &RemoteContext, session_id: &str) -> CloudResult<PushOutcome> {
        let mut manifest = self.fetch_manifest(ctx).await?;

        if manifest.is_tombstoned(session_id) && manifest.session(session_id).is_none() {
            self.mark_synced(session_id, false)?;
            return Ok(PushOutcome::Unchanged);
        }

        self.delete_remote_session(ctx, session_id).await?;
        manifest.add_tombstone(session_id, now_millis());
        self.write_manifest(ctx, &mut manifest).await?;
        self.mark_synced(session_id, false)?;
        debug!("deleted session {session_id} from cloud");
        Ok(PushOutcome::Deleted)
    }

    // ========================================================================
    // Retry queue
    // ========================================================================

    /// Drains every ready queue item under the manifest lock.
    pub async fn process_queue(&self) -> CloudResult<SyncReport> {
        let session = self.active_session().await?;
        let _guard = self.manifest_lock.lock().await;

        let mut report = SyncReport::default();
        self.drain_queue_locked(&session, &mut report).await?;
        self.refresh_pending_count().await?;
        Ok(report.finish())
    }

    async fn drain_queue_locked(
        &self,
        session: &Arc<UnlockedSession>,
        report: &mut SyncReport,
    ) -> CloudResult<()> {
        let drain = self
            .queue
            .process_queue(|item| self.execute_queue_item(session, item))
            .await?;

        report.retried += drain.succeeded;
        report.dropped += drain.dropped.len();
        for message in &drain.errors {
            debug!("queued item failed: {message}");
        }
        for item in drain.dropped {
            let _ = self.events.send(SyncEvent::QueueItemDropped {
                session_id: item.session_id,
                operation: item.operation,
                last_error: item.last_error,
            });
        }
        Ok(())
    }

    async fn execute_queue_item(
        &self,
        session: &Arc<UnlockedSession>,
        item: SyncQueueItem,
    ) -> CloudResult<()> {
        let ctx = self.remote_context(session).await?;
        let outcome = self
            .execute_locked(&ctx, item.operation, &item.session_id)
            .await?;
        debug!(
            "retried {} for session {}: {outcome:?}",
            item.operation, item.session_id
        );
        Ok(())
    }
}
