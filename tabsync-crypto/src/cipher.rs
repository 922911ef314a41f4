//! AES-256-GCM payload sealing.
//!
//! Wire envelope (JSON): `{"v":1,"iv":"<base64 12 bytes>","ct":"<base64>"}`.
//! `ct` carries the ciphertext with the 16-byte GCM tag appended.

use crate::error::{CryptoError, CryptoResult};
use crate::key::EncryptionKey;
use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Current envelope format version.
pub const PAYLOAD_VERSION: u8 = 1;

/// AES-GCM IV size in bytes (96 bits).
pub const IV_SIZE: usize = 12;

/// Versioned AEAD envelope.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    pub v: u8,
    pub iv: String,
    pub ct: String,
}

pub(crate) fn cipher_for(key: &EncryptionKey) -> CryptoResult<Aes256Gcm> {
    Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|e| CryptoError::Encryption(e.to_string()))
}

/// Encrypts `plaintext` under `key` with a fresh random IV.
pub fn encrypt(key: &EncryptionKey, plaintext: &[u8]) -> CryptoResult<EncryptedPayload> {
    let cipher = cipher_for(key)?;

    let mut iv = [0u8; IV_SIZE];
    rand::rng().fill_bytes(&mut iv);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;

    Ok(EncryptedPayload {
        v: PAYLOAD_VERSION,
        iv: STANDARD.encode(iv),
        ct: STANDARD.encode(ciphertext),
    })
}

/// Decrypts an envelope.
///
/// Any failure (unknown version, bad encoding, tag mismatch) yields
/// [`CryptoError::Decryption`] so callers cannot tell the causes apart.
pub fn decrypt(key: &EncryptionKey, payload: &EncryptedPayload) -> CryptoResult<Vec<u8>> {
    if payload.v != PAYLOAD_VERSION {
        return Err(CryptoError::Decryption);
    }

    let iv = STANDARD.decode(&payload.iv).map_err(|_| CryptoError::Decryption)?;
    if iv.len() != IV_SIZE {
        return Err(CryptoError::Decryption);
    }
    let ciphertext = STANDARD.decode(&payload.ct).map_err(|_| CryptoError::Decryption)?;

    let cipher = cipher_for(key)?;
    cipher
        .decrypt(Nonce::from_slice(&iv), ciphertext.as_ref())
        .map_err(|_| CryptoError::Decryption)
}

/// Encrypts a UTF-8 string.
pub fn encrypt_string(key: &EncryptionKey, plaintext: &str) -> CryptoResult<EncryptedPayload> {
    encrypt(key, plaintext.as_bytes())
}

/// Decrypts to a UTF-8 string.
pub fn decrypt_string(key: &EncryptionKey, payload: &EncryptedPayload) -> CryptoResult<String> {
    let bytes = decrypt(key, payload)?;
    String::from_utf8(bytes).map_err(|_| CryptoError::Decryption)
}

/// Serializes `value` to JSON and seals it.
pub fn encrypt_json<T: Serialize>(key: &EncryptionKey, value: &T) -> CryptoResult<EncryptedPayload> {
    let plaintext = serde_json::to_vec(value)?;
    encrypt(key, &plaintext)
}

/// Opens an envelope and deserializes the JSON inside.
pub fn decrypt_json<T: DeserializeOwned>(
    key: &EncryptionKey,
    payload: &EncryptedPayload,
) -> CryptoResult<T> {
    let plaintext = decrypt(key, payload)?;
    Ok(serde_json::from_slice(&plaintext)?)
}
