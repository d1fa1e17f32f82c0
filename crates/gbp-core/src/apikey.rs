//! API key generation, name validation, at-rest encryption, and the
//! wire-authentication check for mutating API calls.
//!
//! The name grammar and key-generation scheme are grounded on `cli/apikey.py`
//! (`validate_key_name`, `create_api_key`, `create_root_key`). The ciphertext
//! format (`base64(salt || nonce || ciphertext)`, AES-256-GCM keyed by a
//! PBKDF2-SHA256-derived key) is `shipper-encrypt`'s scheme, reused verbatim
//! since both exist to encrypt a secret at rest under a passphrase.
//!
//! [`authenticate`] is the "API-key check for mutations" spec.md §1 scopes
//! in (dashboard end-user auth is explicitly out). It's grounded on the
//! original's `graphql/middleware.py` (`ApiKeyMiddleware`), which resolves
//! `name:key` HTTP Basic credentials, and `models.ApiKey.last_used`
//! bookkeeping — but stops at the check itself; wiring it onto an actual
//! HTTP layer is out of scope per spec.md §1.

use std::collections::HashMap;
use std::sync::Mutex;

use aes_gcm::aead::{Aead, KeyInit, OsRng, rand_core::RngCore};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::{STANDARD as BASE64, URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use gbp_types::ApiKey;
use pbkdf2::pbkdf2_hmac_array;
use rand::Rng;
use sha2::Sha256;

const SALT_SIZE: usize = 16;
const NONCE_SIZE: usize = 12;
const PBKDF2_ITERATIONS: u32 = 100_000;
const KEY_SIZE: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("key name must be 1-128 ASCII alphanumeric characters")]
    InvalidName,
    #[error("failed to encrypt API key")]
    Encrypt,
    #[error("failed to decrypt API key: wrong root key or corrupted data")]
    Decrypt,
    /// Deliberately undifferentiated: spec.md §6 requires that a missing
    /// name, a wrong key, and a corrupt ciphertext all reject identically.
    #[error("unauthorized")]
    Unauthorized,
}

/// 1-128 ASCII alphanumerics. Callers lowercase before storing, matching the
/// original's case-insensitive name.
pub fn validate_name(name: &str) -> Result<(), Error> {
    if name.is_empty() || name.len() > 128 || !name.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(Error::InvalidName);
    }
    Ok(())
}

/// A random API key, base64url-encoded, with `length` bytes of entropy. The
/// `secrets.token_urlsafe(settings.API_KEY_LENGTH)` equivalent.
pub fn generate_key(length: usize) -> String {
    let mut rng = rand::thread_rng();
    let mut bytes = vec![0u8; length];
    rng.fill(bytes.as_mut_slice());
    URL_SAFE_NO_PAD.encode(bytes)
}

/// A root key for encrypting API keys at rest. Same shape as [`generate_key`];
/// kept as a separate name because it plays a different role (`ROOT_KEY_NAME`
/// in the original).
pub fn generate_root_key() -> String {
    generate_key(32)
}

/// Encrypt `plaintext` (the key material) under `root_key`, returning
/// base64(salt || nonce || ciphertext).
pub fn encrypt(plaintext: &[u8], root_key: &str) -> Result<String, Error> {
    let mut salt = [0u8; SALT_SIZE];
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut salt);
    OsRng.fill_bytes(&mut nonce_bytes);

    let key = derive_key(root_key, &salt);
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| Error::Encrypt)?;
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| Error::Encrypt)?;

    let mut out = Vec::with_capacity(SALT_SIZE + NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&salt);
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(out))
}

/// Decrypt a value produced by [`encrypt`] under `root_key`.
pub fn decrypt(ciphertext_b64: &str, root_key: &str) -> Result<Vec<u8>, Error> {
    let data = BASE64.decode(ciphertext_b64).map_err(|_| Error::Decrypt)?;
    if data.len() < SALT_SIZE + NONCE_SIZE + 16 {
        return Err(Error::Decrypt);
    }

    let salt = &data[..SALT_SIZE];
    let nonce_bytes = &data[SALT_SIZE..SALT_SIZE + NONCE_SIZE];
    let ciphertext = &data[SALT_SIZE + NONCE_SIZE..];

    let key = derive_key(root_key, salt);
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| Error::Decrypt)?;
    let nonce = Nonce::from_slice(nonce_bytes);
    cipher.decrypt(nonce, ciphertext).map_err(|_| Error::Decrypt)
}

fn derive_key(passphrase: &str, salt: &[u8]) -> [u8; KEY_SIZE] {
    pbkdf2_hmac_array::<Sha256, KEY_SIZE>(passphrase.as_bytes(), salt, PBKDF2_ITERATIONS)
}

/// Persistence for [`ApiKey`]s, looked up case-insensitively by name.
pub trait ApiKeyStore: Send + Sync {
    fn get(&self, name: &str) -> Option<ApiKey>;
    fn save(&self, key: ApiKey);
    /// Record a successful authentication.
    fn touch(&self, name: &str, when: DateTime<Utc>);
}

/// In-memory [`ApiKeyStore`], for tests and the `memory` records backend.
#[derive(Default)]
pub struct MemoryApiKeyStore {
    keys: Mutex<HashMap<String, ApiKey>>,
}

impl MemoryApiKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ApiKeyStore for MemoryApiKeyStore {
    fn get(&self, name: &str) -> Option<ApiKey> {
        self.keys.lock().unwrap().get(&name.to_ascii_lowercase()).cloned()
    }

    fn save(&self, key: ApiKey) {
        self.keys
            .lock()
            .unwrap()
            .insert(key.name.to_ascii_lowercase(), key);
    }

    fn touch(&self, name: &str, when: DateTime<Utc>) {
        if let Some(key) = self.keys.lock().unwrap().get_mut(&name.to_ascii_lowercase()) {
            key.last_used = Some(when);
        }
    }
}

/// Generate and store a new [`ApiKey`] for `name`, encrypting `length`
/// random bytes under `root_key`. Returns the stored record and the
/// plaintext key to show the caller exactly once (the store only ever
/// keeps the ciphertext), matching `create_api_key` in the original.
pub fn create(
    store: &dyn ApiKeyStore,
    name: &str,
    length: usize,
    root_key: &str,
    now: DateTime<Utc>,
) -> Result<(ApiKey, String), Error> {
    validate_name(name)?;
    let plaintext = generate_key(length);
    let ciphertext = encrypt(plaintext.as_bytes(), root_key)?;
    let record = ApiKey {
        name: name.to_ascii_lowercase(),
        key: ciphertext,
        created: now,
        last_used: None,
    };
    store.save(record.clone());
    Ok((record, plaintext))
}

/// The wire-authentication check: does `presented_key` match the key stored
/// for `name`? On success, bumps `last_used`. On any failure — unknown
/// name, wrong key, or a ciphertext that fails to decrypt under `root_key`
/// — returns [`Error::Unauthorized`] without distinguishing which, per
/// spec.md §6.
pub fn authenticate(
    store: &dyn ApiKeyStore,
    name: &str,
    presented_key: &str,
    root_key: &str,
    now: DateTime<Utc>,
) -> Result<(), Error> {
    let record = store.get(name).ok_or(Error::Unauthorized)?;
    let stored_plaintext = decrypt(&record.key, root_key).map_err(|_| Error::Unauthorized)?;
    if stored_plaintext != presented_key.as_bytes() {
        return Err(Error::Unauthorized);
    }
    store.touch(name, now);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_key_is_url_safe_and_has_requested_entropy() {
        let key = generate_key(32);
        assert!(URL_SAFE_NO_PAD.decode(&key).unwrap().len() == 32);
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let root_key = generate_root_key();
        let plaintext = b"a-very-secret-api-key";
        let ciphertext = encrypt(plaintext, &root_key).unwrap();
        assert_eq!(decrypt(&ciphertext, &root_key).unwrap(), plaintext);
    }

    #[test]
    fn decrypt_with_wrong_root_key_fails() {
        let ciphertext = encrypt(b"secret", &generate_root_key()).unwrap();
        assert!(decrypt(&ciphertext, &generate_root_key()).is_err());
    }

    #[test]
    fn encrypt_is_not_deterministic() {
        let root_key = generate_root_key();
        let a = encrypt(b"secret", &root_key).unwrap();
        let b = encrypt(b"secret", &root_key).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn validate_name_accepts_alphanumeric_within_length() {
        assert!(validate_name("ci-runner-1".replace('-', "").as_str()).is_ok());
        assert!(validate_name(&"a".repeat(128)).is_ok());
    }

    #[test]
    fn validate_name_rejects_empty_too_long_or_non_alphanumeric() {
        assert!(matches!(validate_name(""), Err(Error::InvalidName)));
        assert!(matches!(validate_name(&"a".repeat(129)), Err(Error::InvalidName)));
        assert!(matches!(validate_name("has-a-dash"), Err(Error::InvalidName)));
    }
}
