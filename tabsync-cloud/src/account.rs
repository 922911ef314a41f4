//! Account lifecycle: connecting, encryption setup, unlock and re-keying.
//!
//! Key data (salt, verification hash, recovery payload) lives in the local
//! store and is also published unencrypted as `keydata.json` in the remote
//! namespace, which is how a second device learns the salt it needs to
//! derive the same key. None of it is secret without the password.

use crate::blob_store::BlobStoreError;
use crate::error::{CloudError, CloudResult};
use crate::manifest::KEY_DATA_BLOB_NAME;
use crate::session::UnlockedSession;
use crate::sync_engine::{ManifestSyncEngine, RemoteContext};
use crate::types::{
    now_millis, CloudTokens, ConnectOutcome, EncryptionStatus, SyncManifest, SyncState,
    SyncTombstone,
};
use std::sync::Arc;
use tabsync_crypto::{
    create_recovery_payload, generate_recovery_key, open_recovery_payload, setup_encryption,
    validate_password, verify_password, CryptoError, EncryptionKey, EncryptionKeyData,
};
use tabsync_storage::{keys, KvStoreExt};
use tracing::{debug, info, warn};

/// Tokens from a finished consent flow, waiting for setup or join.
pub(crate) struct PendingConnection {
    pub(crate) email: String,
    pub(crate) tokens: CloudTokens,
    pub(crate) remote_key_data: Option<EncryptionKeyData>,
}

impl ManifestSyncEngine {
    // ========================================================================
    // Connect / setup / join
    // ========================================================================

    /// Runs interactive consent and reports whether encryption already
    /// exists for this account.
    pub async fn connect(&self) -> CloudResult<ConnectOutcome> {
        let code = self.oauth.launch_interactive_consent().await?;
        let tokens = self.oauth.exchange_code(&code).await?;
        let email = self.oauth.get_account_email(&tokens.access_token).await?;
        let remote_key_data = self.fetch_remote_key_data(&tokens.access_token).await?;

        let encryption = if remote_key_data.is_some() {
            EncryptionStatus::NeedsPassword
        } else {
            EncryptionStatus::NeedsSetup
        };
        info!("connected cloud account {email} ({encryption:?})");

        *self.pending.lock().await = Some(PendingConnection {
            email: email.clone(),
            tokens,
            remote_key_data,
        });
        Ok(ConnectOutcome { email, encryption })
    }

    /// Creates encryption for a freshly connected account.
    ///
    /// Returns the recovery key in display form; it is never stored.
    pub async fn complete_setup(&self, password: &str) -> CloudResult<String> {
        validate_password(password)?;

        let mut pending = self.pending.lock().await;
        let connection = pending.as_ref().ok_or(CloudError::NotConnected)?;

        let tokens_json = serde_json::to_vec(&connection.tokens)?;
        let setup = setup_encryption(password, Some(&tokens_json))?;
        self.publish_key_data(&connection.tokens.access_token, &setup.key_data)
            .await?;

        let session = Arc::new(UnlockedSession::with_tokens(
            setup.key,
            connection.tokens.clone(),
        ));
        self.kv.set_json(keys::KEY_DATA, &setup.key_data)?;
        self.tokens.save_credentials(
            &session,
            &self.config.provider,
            &connection.email,
            &connection.tokens,
        )?;
        *self.session.write().await = Some(session);
        *pending = None;

        info!("encryption set up, engine unlocked");
        Ok(setup.recovery_key)
    }

    /// Joins an account another device already set up.
    ///
    /// Returns `false` when the password does not match.
    pub async fn complete_join(&self, password: &str) -> CloudResult<bool> {
        let mut pending = self.pending.lock().await;
        let connection = pending.as_ref().ok_or(CloudError::NotConnected)?;

        let key_data = match &connection.remote_key_data {
            Some(key_data) => key_data.clone(),
            None => self
                .fetch_remote_key_data(&connection.tokens.access_token)
                .await?
                .ok_or(CloudError::NotConfigured)?,
        };

        let Some(key) = verify_password(password, &key_data)? else {
            debug!("join rejected: password does not match");
            return Ok(false);
        };

        let session = Arc::new(UnlockedSession::with_tokens(key, connection.tokens.clone()));
        self.kv.set_json(keys::KEY_DATA, &key_data)?;
        self.tokens.save_credentials(
            &session,
            &self.config.provider,
            &connection.email,
            &connection.tokens,
        )?;
        *self.session.write().await = Some(session);
        *pending = None;

        info!("joined existing encrypted account");
        Ok(true)
    }

    // ========================================================================
    // Unlock / lock / disconnect
    // ========================================================================

    /// Derives the key from `password` and, if it verifies, unlocks.
    pub async fn unlock(&self, password: &str) -> CloudResult<bool> {
        let key_data = self.load_key_data()?.ok_or(CloudError::NotConfigured)?;
        if self.tokens.load_credentials()?.is_none() {
            return Err(CloudError::NotConnected);
        }

        let Some(key) = verify_password(password, &key_data)? else {
            debug!("unlock rejected: password does not match");
            return Ok(false);
        };

        let session = UnlockedSession::new(key);
        let tokens = self.tokens.load_tokens(&session)?;
        session.cache_tokens(tokens).await;
        *self.session.write().await = Some(Arc::new(session));

        info!("sync engine unlocked");
        Ok(true)
    }

    /// Drops the key and token cache.
    pub async fn lock(&self) {
        let session = self.session.write().await.take();
        if let Some(session) = session {
            // In-flight operations may still hold a clone.
            session.clear_tokens().await;
            info!("sync engine locked");
        }
    }

    /// Revokes tokens (best effort) and forgets everything account-bound.
    pub async fn disconnect(&self) -> CloudResult<()> {
        let session = self.session.write().await.take();
        let pending = self.pending.lock().await.take();

        let refresh_token = match (&session, &pending) {
            (Some(session), _) => match session.cached_tokens().await {
                Some(tokens) => Some(tokens.refresh_token),
                None => self.tokens.load_tokens(session).ok().map(|t| t.refresh_token),
            },
            (None, Some(pending)) => Some(pending.tokens.refresh_token.clone()),
            (None, None) => None,
        };
        if let Some(token) = refresh_token {
            if let Err(e) = self.oauth.revoke(&token).await {
                warn!("token revocation failed, continuing disconnect: {e}");
            }
        }

        self.tokens.clear_credentials()?;
        self.kv.remove(keys::KEY_DATA)?;
        self.kv.remove(keys::SYNCED_IDS)?;
        self.queue().clear().await?;
        self.update_state(|s| *s = SyncState::default()).await?;

        info!("cloud account disconnected");
        Ok(())
    }

    // ========================================================================
    // Password and recovery
    // ========================================================================

    /// Re-keys under `new_password` and re-uploads everything.
    ///
    /// Runs a full sync under the old key first so nothing only present
    /// remotely is lost by the wipe. Returns the new recovery key.
    pub async fn change_password(&self, current: &str, new_password: &str) -> CloudResult<String> {
        validate_password(new_password)?;
        let key_data = self.load_key_data()?.ok_or(CloudError::NotConfigured)?;
        let email = self
            .tokens
            .load_credentials()?
            .ok_or(CloudError::NotConnected)?
            .email;
        let Some(old_key) = verify_password(current, &key_data)? else {
            return Err(CloudError::Validation(
                "current password is incorrect".to_string(),
            ));
        };

        let old_session = self.live_or_new_session(old_key).await;
        let _guard = self.manifest_lock.lock().await;

        let pre_sync = self.full_sync_locked(&old_session).await;
        self.update_state(|s| s.current_operation = None).await?;
        pre_sync?;
        let old_ctx = self.remote_context(&old_session).await?;
        let tombstones = self.fetch_manifest(&old_ctx).await?.tombstones;

        let tokens = self.tokens.load_tokens(&old_session)?;
        let tokens_json = serde_json::to_vec(&tokens)?;
        let setup = setup_encryption(new_password, Some(&tokens_json))?;
        let session = Arc::new(UnlockedSession::with_tokens(setup.key, tokens.clone()));

        self.install_key(&session, &setup.key_data, &email, &tokens).await?;
        self.rekey_remote_locked(&session, &setup.key_data, tombstones)
            .await?;

        info!("password changed, remote data re-encrypted");
        Ok(setup.recovery_key)
    }

    /// Issues a new recovery key. Salt and verification hash are unchanged.
    pub async fn regenerate_recovery_key(&self, password: &str) -> CloudResult<String> {
        let mut key_data = self.load_key_data()?.ok_or(CloudError::NotConfigured)?;
        let Some(key) = verify_password(password, &key_data)? else {
            return Err(CloudError::Validation("password is incorrect".to_string()));
        };

        let session = self.live_or_new_session(key).await;
        let tokens = self.tokens.get_valid_tokens(&session).await?;
        let tokens_json = serde_json::to_vec(&tokens)?;

        let recovery_key = generate_recovery_key();
        key_data.recovery_payload = Some(create_recovery_payload(
            &recovery_key,
            &key_data.salt,
            &tokens_json,
        )?);

        self.kv.set_json(keys::KEY_DATA, &key_data)?;
        self.publish_key_data(&tokens.access_token, &key_data).await?;

        info!("recovery key regenerated");
        Ok(recovery_key)
    }

    /// Reclaims the account with a recovery key after a lost password.
    ///
    /// Opening the recovery payload proves possession. Everything remote is
    /// wiped and re-uploaded under the new key. Returns the new recovery key.
    pub async fn recover_with_key(&self, recovery_key: &str, new_password: &str) -> CloudResult<String> {
        validate_password(new_password)?;
        let key_data = match self.load_key_data()? {
            Some(key_data) => key_data,
            None => self
                .pending
                .lock()
                .await
                .as_ref()
                .and_then(|p| p.remote_key_data.clone())
                .ok_or(CloudError::NotConfigured)?,
        };
        let payload = key_data.recovery_payload.as_ref().ok_or_else(|| {
            CloudError::Validation("no recovery data for this account".to_string())
        })?;

        let tokens_json = match open_recovery_payload(recovery_key, &key_data.salt, payload) {
            Ok(plaintext) => plaintext,
            Err(CryptoError::Decryption) => {
                return Err(CloudError::Validation(
                    "recovery key does not match".to_string(),
                ));
            }
            Err(e) => return Err(e.into()),
        };
        let tokens: CloudTokens = serde_json::from_slice(&tokens_json)?;

        let email = match self.tokens.load_credentials()? {
            Some(creds) => creds.email,
            None => self.oauth.get_account_email(&tokens.access_token).await?,
        };

        let setup = setup_encryption(new_password, Some(&tokens_json))?;
        let session = Arc::new(UnlockedSession::with_tokens(setup.key, tokens.clone()));

        let _guard = self.manifest_lock.lock().await;
        self.install_key(&session, &setup.key_data, &email, &tokens).await?;
        *self.pending.lock().await = None;
        self.rekey_remote_locked(&session, &setup.key_data, Vec::new())
            .await?;

        info!("account recovered with recovery key, remote data re-encrypted");
        Ok(setup.recovery_key)
    }

    /// The unlocked session if there is one, so token refreshes land in the
    /// cache later syncs read; otherwise a fresh session over `key`.
    async fn live_or_new_session(&self, key: EncryptionKey) -> Arc<UnlockedSession> {
        let live = self.session.read().await.clone();
        match live {
            Some(session) => session,
            None => Arc::new(UnlockedSession::new(key)),
        }
    }

    /// Persists new key material locally and swaps in `session`.
    async fn install_key(
        &self,
        session: &Arc<UnlockedSession>,
        key_data: &EncryptionKeyData,
        email: &str,
        tokens: &CloudTokens,
    ) -> CloudResult<()> {
        self.kv.set_json(keys::KEY_DATA, key_data)?;
        self.tokens
            .save_credentials(session, &self.config.provider, email, tokens)?;
        *self.session.write().await = Some(session.clone());
        Ok(())
    }

    /// Wipes the remote namespace and re-uploads every local session under
    /// the session's key. Caller holds the manifest lock.
    async fn rekey_remote_locked(
        &self,
        session: &Arc<UnlockedSession>,
        key_data: &EncryptionKeyData,
        tombstones: Vec<SyncTombstone>,
    ) -> CloudResult<()> {
        let ctx = self.remote_context(session).await?;
        let wiped = self.wipe_remote(&ctx).await?;
        debug!("wiped {wiped} remote blobs");

        self.publish_key_data(&ctx.access_token, key_data).await?;

        let mut manifest = SyncManifest::empty(self.device_id());
        manifest.tombstones = tombstones;
        manifest.prune_tombstones(now_millis(), self.config.tombstone_retention_ms());
        for local in self.sessions.list()? {
            let meta = self.upload_session(&ctx, &local).await?;
            manifest.upsert_session(meta);
        }
        self.write_manifest(&ctx, &mut manifest).await?;
        self.save_synced_ids(&manifest.session_ids())?;
        Ok(())
    }

    // ========================================================================
    // Remote helpers
    // ========================================================================

    /// Deletes every blob in the namespace. Returns how many went.
    async fn wipe_remote(&self, ctx: &RemoteContext) -> CloudResult<usize> {
        let blobs = self.blobs.list(&ctx.access_token, None).await?;
        let count = blobs.len();
        for blob in blobs {
            match self.blobs.delete(&ctx.access_token, &blob.id).await {
                Ok(()) | Err(BlobStoreError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(count)
    }

    async fn publish_key_data(&self, access_token: &str, key_data: &EncryptionKeyData) -> CloudResult<()> {
        let bytes = serde_json::to_vec(key_data)?;
        self.blobs
            .upload(access_token, KEY_DATA_BLOB_NAME, bytes, None)
            .await?;
        Ok(())
    }

    pub(crate) async fn fetch_remote_key_data(
        &self,
        access_token: &str,
    ) -> CloudResult<Option<EncryptionKeyData>> {
        let Some(id) = self
            .blobs
            .find_by_name(access_token, KEY_DATA_BLOB_NAME, None)
            .await?
        else {
            return Ok(None);
        };
        let bytes = self.blobs.download(access_token, &id).await?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }
}
