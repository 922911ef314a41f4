//! Deterministic digests: password verification hash and content checksum.

use crate::cipher::cipher_for;
use crate::error::{CryptoError, CryptoResult};
use crate::key::{EncryptionKey, Salt};
use aes_gcm::aead::Aead;
use aes_gcm::Nonce;
use sha2::{Digest, Sha256};

/// Length (hex chars) of the verification hash.
pub const VERIFICATION_HASH_LEN: usize = 32;

/// Length (hex chars) of a content checksum.
pub const CHECKSUM_LEN: usize = 16;

const VERIFICATION_PREFIX: &str = "tabsync-verify:";

/// Computes the password verification hash for `key` and `salt`.
///
/// Seals a constant, salt-derived plaintext under an all-zero IV and
/// digests the result. The fixed IV is only acceptable because the
/// plaintext never varies for a given salt; payload encryption must
/// always go through [`crate::encrypt`].
pub fn create_verification_hash(key: &EncryptionKey, salt: &Salt) -> CryptoResult<String> {
    let plaintext = format!("{VERIFICATION_PREFIX}{}", salt.to_base64());
    let cipher = cipher_for(key)?;

    let zero_iv = [0u8; crate::cipher::IV_SIZE];
    let sealed = cipher
        .encrypt(Nonce::from_slice(&zero_iv), plaintext.as_bytes())
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;

    let mut digest = hex::encode(Sha256::digest(&sealed));
    digest.truncate(VERIFICATION_HASH_LEN);
    Ok(digest)
}

/// SHA-256 over the plaintext, hex, truncated to [`CHECKSUM_LEN`].
///
/// Computed before encryption: ciphertext differs on every call.
pub fn compute_checksum(plaintext: &[u8]) -> String {
    let mut digest = hex::encode(Sha256::digest(plaintext));
    digest.truncate(CHECKSUM_LEN);
    digest
}
