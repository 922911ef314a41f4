//! OAuth token lifecycle with serialized refresh.
//!
//! Decrypted tokens are cached in the [`UnlockedSession`]. When they are
//! within the refresh margin of expiry, one caller refreshes while the rest
//! wait on `refresh_lock` and then reuse its result. Providers that rotate
//! refresh tokens invalidate the old one on first use, so two concurrent
//! refreshes would strand whichever caller lost the race.

use crate::error::{CloudError, CloudResult};
use crate::oauth::OAuthProvider;
use crate::session::UnlockedSession;
use crate::types::{CloudCredentials, CloudTokens};
use chrono::Utc;
use std::sync::Arc;
use tabsync_crypto::{decrypt_json, encrypt_json};
use tabsync_storage::{keys, KvStore, KvStoreExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// True when `tokens` must be refreshed before use.
pub fn needs_refresh(tokens: &CloudTokens, margin_secs: i64) -> bool {
    tokens.expires_within_secs(margin_secs)
}

/// Caches, refreshes and persists OAuth tokens.
pub struct TokenManager {
    oauth: Arc<dyn OAuthProvider>,
    kv: Arc<dyn KvStore>,
    refresh_margin_secs: i64,
    /// `tokenRefreshLock`: every refresh runs under this mutex.
    refresh_lock: Mutex<()>,
}

impl TokenManager {
    pub fn new(oauth: Arc<dyn OAuthProvider>, kv: Arc<dyn KvStore>, refresh_margin_secs: i64) -> Self {
        Self {
            oauth,
            kv,
            refresh_margin_secs,
            refresh_lock: Mutex::new(()),
        }
    }

    /// Returns tokens valid for at least the refresh margin.
    pub async fn get_valid_tokens(&self, session: &UnlockedSession) -> CloudResult<CloudTokens> {
        // Fast path: cached and fresh.
        if let Some(tokens) = session.cached_tokens().await {
            if !needs_refresh(&tokens, self.refresh_margin_secs) {
                return Ok(tokens);
            }
            debug!(
                "access token expiring within {}s, refreshing",
                self.refresh_margin_secs
            );
        }

        let _guard = self.refresh_lock.lock().await;

        // Re-check under the lock: a caller ahead of us may have refreshed.
        let current = match session.cached_tokens().await {
            Some(tokens) => tokens,
            None => self.load_tokens(session)?,
        };
        if !needs_refresh(&current, self.refresh_margin_secs) {
            session.cache_tokens(current.clone()).await;
            return Ok(current);
        }

        let refreshed = self
            .oauth
            .refresh(&current.refresh_token)
            .await
            .map_err(|e| {
                warn!("token refresh failed: {e}");
                e
            })?;

        // Persist before releasing the lock so a crash cannot lose a
        // rotated refresh token.
        self.store_tokens(session, &refreshed)?;
        session.cache_tokens(refreshed.clone()).await;
        debug!("refreshed access token, expires at {}", refreshed.expires_at);

        Ok(refreshed)
    }

    /// Forces a refresh regardless of expiry (e.g. after a 401).
    pub async fn force_refresh(&self, session: &UnlockedSession) -> CloudResult<CloudTokens> {
        let _guard = self.refresh_lock.lock().await;
        let current = match session.cached_tokens().await {
            Some(tokens) => tokens,
            None => self.load_tokens(session)?,
        };
        let refreshed = self.oauth.refresh(&current.refresh_token).await?;
        self.store_tokens(session, &refreshed)?;
        session.cache_tokens(refreshed.clone()).await;
        Ok(refreshed)
    }

    /// Decrypts stored tokens with the session key.
    pub fn load_tokens(&self, session: &UnlockedSession) -> CloudResult<CloudTokens> {
        let creds = self.load_credentials()?.ok_or(CloudError::NotConnected)?;
        Ok(decrypt_json(session.key(), &creds.encrypted_tokens)?)
    }

    pub fn load_credentials(&self) -> CloudResult<Option<CloudCredentials>> {
        Ok(self.kv.get_json(keys::CREDENTIALS)?)
    }

    /// Writes a fresh credentials record (connect / re-key).
    pub fn save_credentials(
        &self,
        session: &UnlockedSession,
        provider: &str,
        email: &str,
        tokens: &CloudTokens,
    ) -> CloudResult<()> {
        let creds = CloudCredentials {
            provider: provider.to_string(),
            encrypted_tokens: encrypt_json(session.key(), tokens)?,
            email: email.to_string(),
            connected_at: Utc::now(),
        };
        self.kv.set_json(keys::CREDENTIALS, &creds)?;
        Ok(())
    }

    /// Re-encrypts tokens into the existing credentials record.
    fn store_tokens(&self, session: &UnlockedSession, tokens: &CloudTokens) -> CloudResult<()> {
        let mut creds = self.load_credentials()?.ok_or(CloudError::NotConnected)?;
        creds.encrypted_tokens = encrypt_json(session.key(), tokens)?;
        self.kv.set_json(keys::CREDENTIALS, &creds)?;
        Ok(())
    }

    pub fn clear_credentials(&self) -> CloudResult<()> {
        self.kv.remove(keys::CREDENTIALS)?;
        Ok(())
    }
}
