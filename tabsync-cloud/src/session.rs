//! Session-scoped secrets.
//!
//! An [`UnlockedSession`] exists only between unlock and lock. It owns the
//! derived key and the decrypted-token cache; dropping it (lock, disconnect,
//! process exit) is the only way those secrets go away, and the key is
//! zeroized when that happens.

use crate::types::CloudTokens;
use tabsync_crypto::EncryptionKey;
use tokio::sync::RwLock;

pub struct UnlockedSession {
    key: EncryptionKey,
    tokens: RwLock<Option<CloudTokens>>,
}

impl UnlockedSession {
    pub fn new(key: EncryptionKey) -> Self {
        Self {
            key,
            tokens: RwLock::new(None),
        }
    }

    /// Creates a session whose token cache is already filled.
    pub fn with_tokens(key: EncryptionKey, tokens: CloudTokens) -> Self {
        Self {
            key,
            tokens: RwLock::new(Some(tokens)),
        }
    }

    pub fn key(&self) -> &EncryptionKey {
        &self.key
    }

    pub async fn cached_tokens(&self) -> Option<CloudTokens> {
        self.tokens.read().await.clone()
    }

    pub async fn cache_tokens(&self, tokens: CloudTokens) {
        *self.tokens.write().await = Some(tokens);
    }

    pub async fn clear_tokens(&self) {
        *self.tokens.write().await = None;
    }
}
