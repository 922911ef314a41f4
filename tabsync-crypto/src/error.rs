//! Crypto error types.

use thiserror::Error;

/// Result type for crypto operations.
pub type CryptoResult<T> = Result<T, CryptoError>;

/// Errors that can occur while deriving keys or sealing/opening payloads.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Wrong key, tampered ciphertext, malformed envelope and unsupported
    /// envelope version all collapse into this one variant.
    #[error("wrong key or corrupted data")]
    Decryption,

    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("invalid password: {0}")]
    InvalidPassword(String),

    #[error("invalid recovery key")]
    InvalidRecoveryKey,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
