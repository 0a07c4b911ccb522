//! Slabs and slab slices
//!
//! A slab is one erasure-coded unit of an object: an encryption key, the
//! number of shards needed to recover it, and one sector placement per
//! shard. A slab slice is a byte range of a slab's plaintext.

use crate::crypto::{xor_partial_shards, xor_shards, EncryptionKey};
use crate::erasure::ShardCodec;
use crate::error::{Result, TesseraError};
use crate::types::{HostKey, Sector};
use crate::{LEAF_SIZE, SECTOR_SIZE};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::Write;

/// An erasure-coded, encrypted unit of object data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slab {
    pub key: EncryptionKey,
    pub min_shards: u8,
    /// One placement per shard index
    pub shards: Vec<Sector>,
}

impl Slab {
    /// Create an unplaced slab with a fresh encryption key
    pub fn new(min_shards: u8) -> Self {
        Self {
            key: EncryptionKey::generate(),
            min_shards,
            shards: Vec::new(),
        }
    }

    /// Plaintext capacity of the slab in bytes
    pub fn capacity(&self) -> u64 {
        self.min_shards as u64 * SECTOR_SIZE as u64
    }

    /// Encode plaintext into `total_shards` sector-sized shards
    pub fn encode(&self, data: &[u8], total_shards: usize) -> Result<Vec<Vec<u8>>> {
        ShardCodec::new(self.min_shards as usize, total_shards)?.encode(data)
    }

    /// Encrypt a full set of shards in place
    pub fn encrypt(&self, shards: &mut [Vec<u8>]) {
        xor_shards(&self.key, shards, 0);
    }

    /// Reconstruct every missing shard from decrypted, sector-sized shards
    pub fn reconstruct(&self, shards: &mut [Option<Vec<u8>>]) -> Result<()> {
        ShardCodec::new(self.min_shards as usize, shards.len())?.reconstruct(shards)
    }

    /// Hosts in shard order (duplicates included)
    pub fn hosts(&self) -> impl Iterator<Item = HostKey> + '_ {
        self.shards.iter().map(|s| s.host)
    }

    /// A slab is healthy iff every shard sits on a good host and no host
    /// holds more than one shard.
    pub fn is_healthy(&self, good_hosts: &HashSet<HostKey>) -> bool {
        let mut seen = HashSet::with_capacity(self.shards.len());
        self.shards
            .iter()
            .all(|s| good_hosts.contains(&s.host) && seen.insert(s.host))
    }
}

/// A contiguous byte range of a slab's plaintext
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlabSlice {
    pub slab: Slab,
    pub offset: u32,
    pub length: u32,
}

impl SlabSlice {
    /// Create a validated slice
    pub fn new(slab: Slab, offset: u32, length: u32) -> Result<Self> {
        let max = slab.capacity();
        if slab.min_shards == 0 || offset as u64 + length as u64 > max {
            return Err(TesseraError::InvalidSlice {
                offset,
                length,
                max,
            });
        }
        Ok(Self {
            slab,
            offset,
            length,
        })
    }

    /// A slice covering the whole slab
    pub fn full(slab: Slab) -> Self {
        let length = slab.capacity() as u32;
        Self {
            slab,
            offset: 0,
            length,
        }
    }

    /// Region `(offset, length)` of every shard that holds this slice's
    /// bytes, rounded out to whole leaves.
    pub fn sector_region(&self) -> (u32, u32) {
        let stripe = self.stripe_size();
        let leaf = LEAF_SIZE as u64;
        let end_byte = self.offset as u64 + self.length as u64;

        let start = (self.offset as u64 / stripe) * leaf;
        let mut end = (end_byte / stripe) * leaf;
        if end_byte % stripe != 0 {
            end += leaf;
        }
        (start as u32, (end - start) as u32)
    }

    /// Decrypt downloaded sector regions in place
    pub fn decrypt(&self, shards: &mut [Option<Vec<u8>>]) {
        let (offset, _) = self.sector_region();
        xor_partial_shards(&self.slab.key, shards, offset as u64);
    }

    /// Write the slice's plaintext, recovered from decrypted sector
    /// regions, to `out`. An empty shard set recovers nothing.
    pub fn recover<W: Write>(&self, out: &mut W, mut shards: Vec<Option<Vec<u8>>>) -> Result<()> {
        if shards.iter().all(|s| s.as_ref().map_or(true, Vec::is_empty)) {
            return Ok(());
        }

        let codec = ShardCodec::new(self.slab.min_shards as usize, shards.len())?;
        let skip = (self.offset as u64 % self.stripe_size()) as usize;
        codec.recover(out, &mut shards, skip, self.length as usize)
    }

    fn stripe_size(&self) -> u64 {
        LEAF_SIZE as u64 * self.slab.min_shards.max(1) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SectorRoot;

    fn host(n: u8) -> HostKey {
        HostKey::from_bytes([n; 32])
    }

    fn placed_slab(min_shards: u8, hosts: &[u8]) -> Slab {
        let mut slab = Slab::new(min_shards);
        slab.shards = hosts
            .iter()
            .map(|&h| Sector {
                host: host(h),
                root: SectorRoot::from_bytes([h; 32]),
            })
            .collect();
        slab
    }

    #[test]
    fn test_sector_region() {
        let slab = Slab::new(2);
        // stripe is 128 bytes
        let cases = [
            ((0, 128), (0, 64)),
            ((0, 129), (0, 128)),
            ((127, 2), (0, 128)),
            ((128, 128), (64, 64)),
            ((200, 0), (64, 0)),
        ];
        for ((offset, length), want) in cases {
            let slice = SlabSlice::new(slab.clone(), offset, length).unwrap();
            assert_eq!(slice.sector_region(), want, "offset {offset} length {length}");
        }

        let full = SlabSlice::full(slab);
        assert_eq!(full.sector_region(), (0, SECTOR_SIZE as u32));
    }

    #[test]
    fn test_slice_bounds_are_validated() {
        let slab = Slab::new(1);
        assert!(SlabSlice::new(slab.clone(), 0, SECTOR_SIZE as u32).is_ok());
        assert!(matches!(
            SlabSlice::new(slab, 1, SECTOR_SIZE as u32),
            Err(TesseraError::InvalidSlice { .. })
        ));
    }

    #[test]
    fn test_encrypt_decrypt_recover_subrange() {
        let slab = Slab::new(2);
        let data: Vec<u8> = (0..300_000u32).map(|i| (i % 253) as u8).collect();

        let mut shards = slab.encode(&data, 4).unwrap();
        slab.encrypt(&mut shards);

        let slice = SlabSlice::new(slab, 1_000, 50_000).unwrap();
        let (offset, length) = slice.sector_region();
        let (offset, length) = (offset as usize, length as usize);

        // Fetch the region from shards 1 and 3 only
        let mut regions: Vec<Option<Vec<u8>>> = shards
            .iter()
            .enumerate()
            .map(|(i, s)| (i % 2 == 1).then(|| s[offset..offset + length].to_vec()))
            .collect();
        slice.decrypt(&mut regions);

        let mut out = Vec::new();
        slice.recover(&mut out, regions).unwrap();
        assert_eq!(&out[..], &data[1_000..51_000]);
    }

    #[test]
    fn test_reconstruct_after_decrypt_restores_ciphertext() {
        let slab = Slab::new(2);
        let mut shards = slab.encode(b"reconstruct me", 3).unwrap();
        slab.encrypt(&mut shards);

        let full = SlabSlice::full(slab.clone());
        let mut partial: Vec<Option<Vec<u8>>> = shards.iter().cloned().map(Some).collect();
        partial[0] = None;
        full.decrypt(&mut partial);
        slab.reconstruct(&mut partial).unwrap();

        let mut rebuilt: Vec<Vec<u8>> = partial.into_iter().map(Option::unwrap).collect();
        slab.encrypt(&mut rebuilt);
        assert_eq!(rebuilt, shards);
    }

    #[test]
    fn test_recover_empty_shards_writes_nothing() {
        let slice = SlabSlice::full(Slab::new(2));
        let mut out = Vec::new();
        slice.recover(&mut out, vec![None, Some(Vec::new()), None]).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_is_healthy() {
        let good: HashSet<HostKey> = [1, 2, 3, 4].into_iter().map(host).collect();

        assert!(placed_slab(2, &[1, 2, 3, 4]).is_healthy(&good));
        // bad host
        assert!(!placed_slab(2, &[1, 2, 5, 4]).is_healthy(&good));
        // reused host
        assert!(!placed_slab(2, &[1, 2, 2, 4]).is_healthy(&good));
    }
}
