//! Bearer token minting and hashing.
//!
//! Tokens are opaque random bytes handed to the client exactly once at
//! registration time. The server only ever persists `sha256(raw)`; a leaked
//! database dump does not leak usable credentials.

use rand::RngCore;
use sha2::{Digest, Sha256};

/// Number of random bytes backing a freshly minted token, before base64 encoding.
const TOKEN_BYTES: usize = 32;

/// Generate a new bearer token. Returns the raw token (shown to the caller
/// once) and its hash (what actually gets stored).
pub fn generate_token() -> (String, String) {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    let raw = base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, bytes);
    let hash = hash_token(&raw);
    (raw, hash)
}

/// Hash a raw bearer token the same way it was hashed at mint time, so it
/// can be looked up by `db::tokens::validate_token`.
pub fn hash_token(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_tokens_are_unique() {
        let (raw1, hash1) = generate_token();
        let (raw2, hash2) = generate_token();
        assert_ne!(raw1, raw2);
        assert_ne!(hash1, hash2);
    }

    #[test]
    fn hashing_is_deterministic() {
        let (raw, hash) = generate_token();
        assert_eq!(hash_token(&raw), hash);
    }
}
