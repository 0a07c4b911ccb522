//! Shard encryption for Tessera
//!
//! Provides:
//! - Per-slab 256-bit encryption keys
//! - A seekable per-shard keystream (keyed Blake3 in XOF mode)
//!
//! Shards are encrypted in place and keep their length, so ciphertext stays
//! sector sized and any sub-range of a sector can be decrypted on its own
//! by seeking the keystream to the range's offset.

use rand::rngs::OsRng;
use rand::RngCore;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Encryption key size (32 bytes)
pub const KEY_SIZE: usize = 32;

/// Keystream block generated per XOF read
const KEYSTREAM_BLOCK: usize = 4096;

/// Per-slab encryption key
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey([u8; KEY_SIZE]);

impl EncryptionKey {
    /// Generate a new random encryption key
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the raw key bytes
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EncryptionKey([REDACTED])")
    }
}

impl Drop for EncryptionKey {
    fn drop(&mut self) {
        // Zeroize key on drop
        self.0.iter_mut().for_each(|b| *b = 0);
    }
}

impl Serialize for EncryptionKey {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for EncryptionKey {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bytes: Vec<u8> = Deserialize::deserialize(deserializer)?;
        if bytes.len() != KEY_SIZE {
            return Err(serde::de::Error::custom("Invalid key length"));
        }
        let mut arr = [0u8; KEY_SIZE];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

/// XOR `buf` with the keystream of shard `shard_index`, starting at byte
/// `offset` of that shard.
///
/// Encryption and decryption are the same operation.
pub fn xor_keystream(key: &EncryptionKey, shard_index: usize, offset: u64, buf: &mut [u8]) {
    let mut hasher = blake3::Hasher::new_keyed(key.as_bytes());
    hasher.update(&(shard_index as u64).to_le_bytes());
    let mut reader = hasher.finalize_xof();
    reader.set_position(offset);

    let mut block = [0u8; KEYSTREAM_BLOCK];
    for chunk in buf.chunks_mut(KEYSTREAM_BLOCK) {
        let stream = &mut block[..chunk.len()];
        reader.fill(stream);
        chunk.iter_mut().zip(stream.iter()).for_each(|(b, k)| *b ^= k);
    }
}

/// Encrypt (or decrypt) a full shard set in place, shard-parallel
pub fn xor_shards(key: &EncryptionKey, shards: &mut [Vec<u8>], offset: u64) {
    shards
        .par_iter_mut()
        .enumerate()
        .for_each(|(index, shard)| xor_keystream(key, index, offset, shard));
}

/// Like [`xor_shards`], skipping shards that are not present
pub fn xor_partial_shards(key: &EncryptionKey, shards: &mut [Option<Vec<u8>>], offset: u64) {
    shards
        .par_iter_mut()
        .enumerate()
        .for_each(|(index, shard)| {
            if let Some(shard) = shard {
                xor_keystream(key, index, offset, shard);
            }
        });
}
