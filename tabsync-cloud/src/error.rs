//! Cloud sync error types.

use crate::blob_store::BlobStoreError;
use tabsync_crypto::CryptoError;
use tabsync_storage::StorageError;
use thiserror::Error;

/// Result type for cloud operations.
pub type CloudResult<T> = Result<T, CloudError>;

/// Errors that can occur in cloud sync operations.
#[derive(Debug, Error)]
pub enum CloudError {
    /// Bad password, malformed payload or argument. Raised before any
    /// network call.
    #[error("validation failed: {0}")]
    Validation(String),

    /// AEAD failure. Never split into finer causes.
    #[error("crypto error: {0}")]
    Crypto(CryptoError),

    /// Provider rejected or revoked the tokens; the user must reconnect.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Network, rate-limit or storage-full failure from the blob store.
    #[error("blob store error: {0}")]
    Transient(BlobStoreError),

    #[error("encryption has not been set up")]
    NotConfigured,

    #[error("sync engine is locked (password required)")]
    Locked,

    #[error("no cloud account connected")]
    NotConnected,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl CloudError {
    /// Worth retrying later with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, CloudError::Transient(_) | CloudError::Http(_))
    }

    /// Requires the user to reconnect.
    pub fn is_auth(&self) -> bool {
        matches!(self, CloudError::Auth(_))
    }
}

impl From<CryptoError> for CloudError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::InvalidPassword(msg) => CloudError::Validation(msg),
            CryptoError::InvalidRecoveryKey => {
                CloudError::Validation("invalid recovery key".to_string())
            }
            other => CloudError::Crypto(other),
        }
    }
}

impl From<BlobStoreError> for CloudError {
    fn from(err: BlobStoreError) -> Self {
        match err {
            BlobStoreError::Unauthorized => {
                CloudError::Auth("blob store rejected the access token".to_string())
            }
            other => CloudError::Transient(other),
        }
    }
}
