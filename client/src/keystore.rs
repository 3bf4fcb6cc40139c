//! The shared 32-byte symmetric key (§4.1/§6.3), wrapped at rest under a
//! key derived from the master password via Argon2, a memory-hard KDF.
//!
//! The wrapped blob has a public `key_id` — SHA-256 of the wrapped
//! ciphertext — so two machines can confirm out of band that they loaded
//! the same key without ever comparing the key itself.

use argon2::password_hash::SaltString;
use argon2::Argon2;
use chacha20poly1305::aead::{Aead, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;

pub const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum KeystoreError {
    #[error("incorrect password or corrupted keystore")]
    WrongPassword,
    #[error("malformed keystore file")]
    Malformed,
    #[error("key derivation failed")]
    Kdf,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Keystore {
    key_id: String,
    salt: String,
    nonce: String,
    wrapped_key: String,
}

impl Keystore {
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn exists(path: &Path) -> bool {
        path.exists()
    }

    pub fn load(path: &Path) -> Result<Self, KeystoreError> {
        let bytes = std::fs::read(path)?;
        serde_json::from_slice(&bytes).map_err(|_| KeystoreError::Malformed)
    }

    pub fn save(&self, path: &Path) -> Result<(), KeystoreError> {
        let bytes = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    /// Wrap `raw_key` under `password`, producing a fresh keystore file.
    pub fn wrap(password: &str, raw_key: &[u8; KEY_LEN]) -> Result<Self, KeystoreError> {
        let salt = SaltString::generate(&mut OsRng);
        let derived = derive_wrapping_key(password, &salt)?;

        let cipher = ChaCha20Poly1305::new((&derived).into());
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, raw_key.as_slice())
            .map_err(|_| KeystoreError::Kdf)?;

        let wrapped_key = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &ciphertext);
        let key_id = hex::encode(Sha256::digest(wrapped_key.as_bytes()));

        Ok(Keystore {
            key_id,
            salt: salt.to_string(),
            nonce: base64::Engine::encode(&base64::engine::general_purpose::STANDARD, nonce_bytes),
            wrapped_key,
        })
    }

    /// Unwrap the shared key using `password`. Wrong password surfaces as
    /// `WrongPassword` (AEAD tag verification failure), never a panic.
    pub fn unlock(&self, password: &str) -> Result<[u8; KEY_LEN], KeystoreError> {
        let salt = SaltString::from_b64(&self.salt).map_err(|_| KeystoreError::Malformed)?;
        let derived = derive_wrapping_key(password, &salt)?;

        let nonce_bytes = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, &self.nonce)
            .map_err(|_| KeystoreError::Malformed)?;
        let ciphertext = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, &self.wrapped_key)
            .map_err(|_| KeystoreError::Malformed)?;

        let cipher = ChaCha20Poly1305::new((&derived).into());
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_slice())
            .map_err(|_| KeystoreError::WrongPassword)?;

        plaintext.try_into().map_err(|_| KeystoreError::Malformed)
    }
}

fn derive_wrapping_key(password: &str, salt: &SaltString) -> Result<[u8; KEY_LEN], KeystoreError> {
    let argon2 = Argon2::default();
    let mut out = [0u8; KEY_LEN];
    argon2
        .hash_password_into(password.as_bytes(), salt.as_str().as_bytes(), &mut out)
        .map_err(|_| KeystoreError::Kdf)?;
    Ok(out)
}

/// Generate a fresh random 32-byte shared key (used by `tangle init`).
pub fn generate_key() -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    rand::rng().fill_bytes(&mut key);
    key
}

pub fn encode_key(key: &[u8; KEY_LEN]) -> String {
    base64::Engine::encode(&base64::engine::general_purpose::STANDARD, key)
}

pub fn decode_key(encoded: &str) -> anyhow::Result<[u8; KEY_LEN]> {
    let bytes = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, encoded.trim())?;
    bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("key must decode to exactly {} bytes", KEY_LEN))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_and_unlock_round_trips() {
        let key = generate_key();
        let ks = Keystore::wrap("hunter2", &key).unwrap();
        let unlocked = ks.unlock("hunter2").unwrap();
        assert_eq!(unlocked, key);
    }

    #[test]
    fn wrong_password_fails() {
        let key = generate_key();
        let ks = Keystore::wrap("hunter2", &key).unwrap();
        assert!(matches!(ks.unlock("wrong"), Err(KeystoreError::WrongPassword)));
    }

    #[test]
    fn key_id_is_stable_for_same_wrap() {
        let key = generate_key();
        let ks = Keystore::wrap("hunter2", &key).unwrap();
        assert_eq!(ks.key_id().len(), 64);
    }
}
