//! Key derivation and key material.

use crate::error::{CryptoError, CryptoResult};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::Sha256;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// AES-256 key size in bytes.
pub const KEY_SIZE: usize = 32;

/// Salt size in bytes.
pub const SALT_SIZE: usize = 32;

/// PBKDF2-HMAC-SHA256 iteration count.
pub const KDF_ITERATIONS: u32 = 100_000;

/// A derived AES-256-GCM key.
///
/// Raw bytes are only reachable inside this crate; callers can seal and
/// open payloads with it but never export it.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey {
    bytes: [u8; KEY_SIZE],
}

impl EncryptionKey {
    pub(crate) fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub(crate) fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey([redacted])")
    }
}

/// Random per-account KDF salt. Serialized as base64.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Salt([u8; SALT_SIZE]);

impl Salt {
    /// Generates a fresh random salt.
    pub fn random() -> Self {
        let mut bytes = [0u8; SALT_SIZE];
        rand::rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; SALT_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SALT_SIZE] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    pub fn from_base64(encoded: &str) -> CryptoResult<Self> {
        let decoded = STANDARD
            .decode(encoded)
            .map_err(|e| CryptoError::KeyDerivation(format!("invalid salt encoding: {e}")))?;
        let bytes: [u8; SALT_SIZE] =
            decoded
                .as_slice()
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    expected: SALT_SIZE,
                    actual: decoded.len(),
                })?;
        Ok(Self(bytes))
    }
}

impl fmt::Debug for Salt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Salt({})", self.to_base64())
    }
}

impl Serialize for Salt {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for Salt {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        Salt::from_base64(&encoded).map_err(serde::de::Error::custom)
    }
}

/// Derives an AES-256 key from a password and salt.
///
/// Deterministic: the same `(password, salt)` always yields the same key.
pub fn derive_key(password: &str, salt: &Salt) -> CryptoResult<EncryptionKey> {
    if password.is_empty() {
        return Err(CryptoError::KeyDerivation("empty passphrase".to_string()));
    }

    let mut bytes = [0u8; KEY_SIZE];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt.as_bytes(), KDF_ITERATIONS, &mut bytes);
    Ok(EncryptionKey::from_bytes(bytes))
}

/// Derives a key from a displayed recovery key (dashes and whitespace ignored).
pub fn derive_key_from_recovery(recovery_key: &str, salt: &Salt) -> CryptoResult<EncryptionKey> {
    let normalized = crate::recovery::normalize_recovery_key(recovery_key)?;
    derive_key(&normalized, salt)
}

/// Generates a random key. Only used where no password is involved.
#[cfg(test)]
pub(crate) fn generate_random_key() -> EncryptionKey {
    let mut bytes = [0u8; KEY_SIZE];
    rand::rng().fill_bytes(&mut bytes);
    EncryptionKey::from_bytes(bytes)
}
