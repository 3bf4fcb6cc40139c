//! Content-defined chunker and per-chunk cryptor (C1).
//!
//! One chunking tier: FastCDC (2020 variant) with
//! `min = 1 MiB, avg = 4 MiB, max = 16 MiB`. Each plaintext chunk is
//! hashed with SHA-256 (the chunk hash used for dedup and the per-file
//! chunk manifest) and independently encrypted with ChaCha20-Poly1305
//! before upload. The stored blob layout is `nonce ‖ ciphertext ‖ tag`.

use chacha20poly1305::aead::{Aead, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::keystore::KEY_LEN;

const MIN_SIZE: u32 = 1024 * 1024;
const AVG_SIZE: u32 = 4 * 1024 * 1024;
const MAX_SIZE: u32 = 16 * 1024 * 1024;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("chunk decryption failed, ciphertext or key mismatch")]
    DecryptError,
    #[error("stored chunk is shorter than nonce+tag, corrupt blob")]
    ChunkFormatError,
}

/// One content-addressed plaintext chunk, as produced by `chunk_bytes`.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub hash: String,
    pub data: Vec<u8>,
    pub offset: u64,
    pub length: u32,
}

/// Split `data` into content-defined chunks and hash each with SHA-256.
/// Deterministic: identical bytes always produce identical chunk
/// boundaries and hashes.
pub fn chunk_bytes(data: &[u8]) -> Vec<Chunk> {
    if data.is_empty() {
        return vec![Chunk {
            hash: hash_bytes(data),
            data: Vec::new(),
            offset: 0,
            length: 0,
        }];
    }

    let chunker = fastcdc::v2020::FastCDC::new(data, MIN_SIZE, AVG_SIZE, MAX_SIZE);
    chunker
        .map(|c| {
            let slice = &data[c.offset..c.offset + c.length];
            Chunk {
                hash: hash_bytes(slice),
                data: slice.to_vec(),
                offset: c.offset as u64,
                length: c.length as u32,
            }
        })
        .collect()
}

/// SHA-256 of `data`, hex-encoded. Used both for chunk hashes and a
/// file's whole-content hash.
pub fn hash_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Encrypt one plaintext chunk with a random nonce. Ciphertext is never
/// used for dedup — only the plaintext hash is.
pub fn encrypt_chunk(key: &[u8; KEY_LEN], plaintext: &[u8]) -> Vec<u8> {
    let cipher = ChaCha20Poly1305::new(key.into());
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    // ChaCha20Poly1305 only fails to encrypt on message-length overflow,
    // which cannot happen for chunk-sized inputs bounded by MAX_SIZE.
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .expect("chunk-sized plaintext always fits within AEAD limits");

    let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    blob.extend_from_slice(&nonce_bytes);
    blob.extend_from_slice(&ciphertext);
    blob
}

/// Decrypt a stored blob (`nonce ‖ ciphertext ‖ tag`) back to plaintext.
pub fn decrypt_chunk(key: &[u8; KEY_LEN], blob: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if blob.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::ChunkFormatError);
    }
    let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
    let cipher = ChaCha20Poly1305::new(key.into());
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| CryptoError::DecryptError)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_cover_entire_input_with_no_gaps() {
        let data: Vec<u8> = (0..3_000_000u32).map(|i| (i % 251) as u8).collect();
        let chunks = chunk_bytes(&data);

        let mut expected_offset = 0u64;
        for chunk in &chunks {
            assert_eq!(chunk.offset, expected_offset);
            assert_eq!(chunk.data.len(), chunk.length as usize);
            expected_offset += chunk.length as u64;
        }
        assert_eq!(expected_offset, data.len() as u64);
    }

    #[test]
    fn chunking_is_deterministic() {
        let data: Vec<u8> = (0..2_000_000u32).map(|i| (i % 97) as u8).collect();
        let a = chunk_bytes(&data);
        let b = chunk_bytes(&data);
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.hash, y.hash);
        }
    }

    #[test]
    fn empty_input_yields_single_empty_chunk() {
        let chunks = chunk_bytes(&[]);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].length, 0);
    }

    #[test]
    fn encrypt_decrypt_round_trips() {
        let key = [7u8; KEY_LEN];
        let plaintext = b"hello from a sync chunk";
        let blob = encrypt_chunk(&key, plaintext);
        let decrypted = decrypt_chunk(&key, &blob).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn decrypt_with_wrong_key_fails() {
        let blob = encrypt_chunk(&[1u8; KEY_LEN], b"payload");
        let err = decrypt_chunk(&[2u8; KEY_LEN], &blob).unwrap_err();
        assert!(matches!(err, CryptoError::DecryptError));
    }

    #[test]
    fn truncated_blob_is_a_format_error() {
        let err = decrypt_chunk(&[0u8; KEY_LEN], &[1, 2, 3]).unwrap_err();
        assert!(matches!(err, CryptoError::ChunkFormatError));
    }
}
