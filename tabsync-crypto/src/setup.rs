//! First-time setup and password verification.

use crate::cipher::EncryptedPayload;
use crate::digest::create_verification_hash;
use crate::error::{CryptoError, CryptoResult};
use crate::key::{derive_key, EncryptionKey, Salt};
use crate::recovery::{create_recovery_payload, generate_recovery_key};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

/// Minimum accepted password length, in characters.
pub const MIN_PASSWORD_LEN: usize = 6;

/// Persisted key material. Holds no plaintext secret.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionKeyData {
    pub salt: Salt,
    pub verification_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery_payload: Option<EncryptedPayload>,
}

/// Output of [`setup_encryption`].
///
/// `recovery_key` must be shown to the user once and then dropped.
pub struct EncryptionSetup {
    pub key_data: EncryptionKeyData,
    pub recovery_key: String,
    pub key: EncryptionKey,
}

/// Rejects passwords that are too short before any KDF work is done.
pub fn validate_password(password: &str) -> CryptoResult<()> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(CryptoError::InvalidPassword(format!(
            "password too short (min {MIN_PASSWORD_LEN} characters)"
        )));
    }
    Ok(())
}

/// Creates fresh key material for `password`.
///
/// When `recovery_plaintext` is given it is sealed under the new recovery
/// key and stored as the recovery payload.
pub fn setup_encryption(
    password: &str,
    recovery_plaintext: Option<&[u8]>,
) -> CryptoResult<EncryptionSetup> {
    validate_password(password)?;

    let salt = Salt::random();
    let key = derive_key(password, &salt)?;
    let verification_hash = create_verification_hash(&key, &salt)?;
    let recovery_key = generate_recovery_key();

    let recovery_payload = recovery_plaintext
        .map(|plaintext| create_recovery_payload(&recovery_key, &salt, plaintext))
        .transpose()?;

    Ok(EncryptionSetup {
        key_data: EncryptionKeyData {
            salt,
            verification_hash,
            recovery_payload,
        },
        recovery_key,
        key,
    })
}

/// Derives the key for `password` and checks it against `key_data`.
///
/// Returns `Ok(None)` for a wrong password.
pub fn verify_password(
    password: &str,
    key_data: &EncryptionKeyData,
) -> CryptoResult<Option<EncryptionKey>> {
    if password.is_empty() {
        return Ok(None);
    }

    let key = derive_key(password, &key_data.salt)?;
    let hash = create_verification_hash(&key, &key_data.salt)?;
    if bool::from(hash.as_bytes().ct_eq(key_data.verification_hash.as_bytes())) {
        Ok(Some(key))
    } else {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::open_recovery_payload;

    #[test]
    fn setup_then_verify() {
        let setup = setup_encryption("abc123", None).unwrap();
        assert!(verify_password("abc123", &setup.key_data).unwrap().is_some());
        assert!(verify_password("wrong", &setup.key_data).unwrap().is_none());
    }

    #[test]
    fn tampered_or_truncated_hash_rejects_correct_password() {
        let mut key_data = setup_encryption("abc123", None).unwrap().key_data;
        let original = key_data.verification_hash.clone();

        key_data.verification_hash.truncate(original.len() - 1);
        assert!(verify_password("abc123", &key_data).unwrap().is_none());

        let flipped = if original.ends_with('0') { '1' } else { '0' };
        key_data.verification_hash = format!("{}{flipped}", &original[..original.len() - 1]);
        assert!(verify_password("abc123", &key_data).unwrap().is_none());

        key_data.verification_hash = original;
        assert!(verify_password("abc123", &key_data).unwrap().is_some());
    }

    #[test]
    fn short_password_rejected() {
        assert!(matches!(
            setup_encryption("abc", None),
            Err(CryptoError::InvalidPassword(_))
        ));
    }

    #[test]
    fn recovery_payload_sealed_with_recovery_key() {
        let setup = setup_encryption("abc123", Some(b"{\"t\":1}")).unwrap();
        let payload = setup.key_data.recovery_payload.as_ref().unwrap();
        let opened =
            open_recovery_payload(&setup.recovery_key, &setup.key_data.salt, payload).unwrap();
        assert_eq!(opened, b"{\"t\":1}");
    }

    #[test]
    fn key_data_serializes_camel_case() {
        let setup = setup_encryption("abc123", None).unwrap();
        let json = serde_json::to_value(&setup.key_data).unwrap();
        assert!(json.get("verificationHash").is_some());
        assert!(json.get("salt").is_some());
        assert!(json.get("recoveryPayload").is_none());
    }
}
