//! Encryption layer for TabSync cloud sync.
//!
//! Every byte that leaves the device is sealed here:
//! - PBKDF2-HMAC-SHA256 (100,000 iterations) derives an AES-256 key from
//!   the user's password and a per-account random salt
//! - AES-256-GCM with a fresh 96-bit IV per call seals payloads into a
//!   versioned `{v, iv, ct}` envelope
//! - A deterministic verification hash lets unlock check the password
//!   without touching real data
//! - Recovery keys re-derive a key through the same KDF so cloud tokens
//!   can be reclaimed after a forgotten password
//!
//! # Key lifecycle
//!
//! The derived key is never stored. It lives in memory from unlock until
//! lock (or process exit) and is zeroized on drop. The only persisted
//! material is [`EncryptionKeyData`]: salt, verification hash and an
//! optional recovery payload, none of which are secret on their own.

mod cipher;
mod digest;
mod error;
mod key;
pub mod recovery;
mod setup;

pub use cipher::{
    decrypt, decrypt_json, decrypt_string, encrypt, encrypt_json, encrypt_string,
    EncryptedPayload, IV_SIZE, PAYLOAD_VERSION,
};
pub use digest::{compute_checksum, create_verification_hash, CHECKSUM_LEN, VERIFICATION_HASH_LEN};
pub use error::{CryptoError, CryptoResult};
pub use key::{derive_key, derive_key_from_recovery, EncryptionKey, Salt, KDF_ITERATIONS, KEY_SIZE, SALT_SIZE};
pub use recovery::{
    create_recovery_payload, format_recovery_key, generate_recovery_key, normalize_recovery_key,
    open_recovery_payload, RECOVERY_KEY_BYTES,
};
pub use setup::{
    setup_encryption, validate_password, verify_password, EncryptionKeyData, EncryptionSetup,
    MIN_PASSWORD_LEN,
};
