//! Recovery keys.
//!
//! A recovery key is 32 random bytes shown to the user once, as base64
//! grouped in blocks of four (`AbCd-EfGh-...`). It is fed through the same
//! KDF as a password and the resulting key seals a recovery payload that
//! holds the cloud tokens. Losing the password but keeping the recovery key
//! is enough to reclaim the cloud connection.

use crate::cipher::{decrypt, encrypt, EncryptedPayload};
use crate::error::{CryptoError, CryptoResult};
use crate::key::{derive_key_from_recovery, Salt};
use base64::Engine;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use rand::RngCore;
use zeroize::Zeroize;

/// Raw recovery key size in bytes.
pub const RECOVERY_KEY_BYTES: usize = 32;

const GROUP_LEN: usize = 4;

/// Generates a new recovery key in display form.
pub fn generate_recovery_key() -> String {
    let mut bytes = [0u8; RECOVERY_KEY_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    let encoded = STANDARD_NO_PAD.encode(bytes);
    bytes.zeroize();
    format_recovery_key(&encoded)
}

/// Groups an encoded key into dash-separated blocks of four characters.
pub fn format_recovery_key(encoded: &str) -> String {
    encoded
        .as_bytes()
        .chunks(GROUP_LEN)
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect::<Vec<_>>()
        .join("-")
}

/// Strips dashes and whitespace and checks the key decodes to 32 bytes.
pub fn normalize_recovery_key(display: &str) -> CryptoResult<String> {
    let normalized: String = display
        .chars()
        .filter(|c| *c != '-' && !c.is_whitespace())
        .collect();

    let decoded = STANDARD_NO_PAD
        .decode(&normalized)
        .map_err(|_| CryptoError::InvalidRecoveryKey)?;
    if decoded.len() != RECOVERY_KEY_BYTES {
        return Err(CryptoError::InvalidRecoveryKey);
    }

    Ok(normalized)
}

/// Seals `plaintext` under the key derived from `recovery_key` and `salt`.
pub fn create_recovery_payload(
    recovery_key: &str,
    salt: &Salt,
    plaintext: &[u8],
) -> CryptoResult<EncryptedPayload> {
    let key = derive_key_from_recovery(recovery_key, salt)?;
    encrypt(&key, plaintext)
}

/// Opens a recovery payload. Success is the proof of possession.
pub fn open_recovery_payload(
    recovery_key: &str,
    salt: &Salt,
    payload: &EncryptedPayload,
) -> CryptoResult<Vec<u8>> {
    let key = derive_key_from_recovery(recovery_key, salt)?;
    decrypt(&key, payload)
}
