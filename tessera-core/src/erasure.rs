//! Striped Reed-Solomon shard coding
//!
//! Implements (k=min_shards, n=total_shards) coding where:
//! - every shard is exactly one sector
//! - plaintext is striped across the k data shards in `LEAF_SIZE` segments
//! - n-k parity shards are computed over the data shards
//! - any k shards reconstruct the rest
//!
//! Striping (rather than splitting the slab into k contiguous pieces) keeps
//! a contiguous plaintext range inside the same contiguous region of every
//! shard, which is what makes partial sector downloads possible.

use crate::error::{Result, TesseraError};
use crate::{LEAF_SIZE, SECTOR_SIZE};
use reed_solomon_erasure::galois_8::ReedSolomon;
use std::io::Write;

/// Reed-Solomon encoder/decoder over sector-sized shards
pub struct ShardCodec {
    min_shards: usize,
    total_shards: usize,
    /// `None` when there are no parity shards (min == total)
    encoder: Option<ReedSolomon>,
}

impl ShardCodec {
    /// Create a codec for `min_shards`-of-`total_shards` coding
    pub fn new(min_shards: usize, total_shards: usize) -> Result<Self> {
        if min_shards == 0 || total_shards < min_shards {
            return Err(TesseraError::InvalidRedundancy(format!(
                "cannot code {min_shards}-of-{total_shards}"
            )));
        }
        let parity = total_shards - min_shards;
        let encoder = if parity > 0 {
            Some(ReedSolomon::new(min_shards, parity)?)
        } else {
            None
        };
        Ok(Self {
            min_shards,
            total_shards,
            encoder,
        })
    }

    pub fn min_shards(&self) -> usize {
        self.min_shards
    }

    pub fn total_shards(&self) -> usize {
        self.total_shards
    }

    /// Encode up to `min_shards * SECTOR_SIZE` bytes into `total_shards`
    /// sector-sized shards. Short input is zero padded.
    pub fn encode(&self, data: &[u8]) -> Result<Vec<Vec<u8>>> {
        let max = self.min_shards * SECTOR_SIZE;
        if data.len() > max {
            return Err(TesseraError::SlabTooLarge {
                size: data.len(),
                max,
            });
        }

        let mut shards = vec![vec![0u8; SECTOR_SIZE]; self.total_shards];
        striped_split(data, &mut shards[..self.min_shards]);

        // Encode (fills in parity shards)
        if let Some(encoder) = &self.encoder {
            encoder.encode(&mut shards)?;
        }
        Ok(shards)
    }

    /// Reconstruct every missing shard, data and parity.
    ///
    /// Requires at least `min_shards` shards to be present. All present
    /// shards must have the same length; it does not need to be a full
    /// sector, so sector regions can be reconstructed as well.
    pub fn reconstruct(&self, shards: &mut [Option<Vec<u8>>]) -> Result<()> {
        self.check_present(shards)?;
        match &self.encoder {
            Some(encoder) => Ok(encoder.reconstruct(shards)?),
            None => Ok(()),
        }
    }

    /// Reconstruct only the missing data shards
    pub fn reconstruct_data(&self, shards: &mut [Option<Vec<u8>>]) -> Result<()> {
        self.check_present(shards)?;
        if shards[..self.min_shards].iter().all(Option::is_some) {
            return Ok(());
        }
        match &self.encoder {
            Some(encoder) => Ok(encoder.reconstruct_data(shards)?),
            None => Ok(()),
        }
    }

    /// Rebuild plaintext from (possibly partial) shards.
    ///
    /// Missing data shards are reconstructed first. The joined stripe stream
    /// is written to `out` after skipping `skip` bytes, and exactly `length`
    /// bytes are written.
    pub fn recover<W: Write>(
        &self,
        out: &mut W,
        shards: &mut [Option<Vec<u8>>],
        skip: usize,
        length: usize,
    ) -> Result<()> {
        self.reconstruct_data(shards)?;

        let data: Vec<&[u8]> = shards[..self.min_shards]
            .iter()
            .map(|s| s.as_deref().unwrap_or_default())
            .collect();
        striped_join(out, &data, skip, length)
    }

    fn check_present(&self, shards: &[Option<Vec<u8>>]) -> Result<()> {
        if shards.len() != self.total_shards {
            return Err(TesseraError::ShardCountMismatch {
                expected: self.total_shards,
                actual: shards.len(),
            });
        }

        let available = shards.iter().filter(|s| s.is_some()).count();
        if available < self.min_shards {
            return Err(TesseraError::InsufficientShards {
                available,
                required: self.min_shards,
            });
        }

        let mut sizes = shards.iter().flatten().map(Vec::len);
        if let Some(expected) = sizes.next() {
            if let Some(actual) = sizes.find(|&len| len != expected) {
                return Err(TesseraError::ShardSizeMismatch { expected, actual });
            }
        }
        Ok(())
    }
}

/// Distribute `data` round-robin across `shards` in `LEAF_SIZE` segments
fn striped_split(data: &[u8], shards: &mut [Vec<u8>]) {
    let stripes = shards.len();
    for (leaf, segment) in data.chunks(LEAF_SIZE).enumerate() {
        let offset = (leaf / stripes) * LEAF_SIZE;
        shards[leaf % stripes][offset..offset + segment.len()].copy_from_slice(segment);
    }
}

/// Inverse of [`striped_split`], restricted to `skip..skip + length`
fn striped_join<W: Write>(out: &mut W, data: &[&[u8]], skip: usize, length: usize) -> Result<()> {
    let mut skip = skip;
    let mut remaining = length;
    if remaining == 0 {
        return Ok(());
    }

    let shard_len = data.first().map(|s| s.len()).unwrap_or(0);
    for offset in (0..shard_len).step_by(LEAF_SIZE) {
        for shard in data {
            let end = (offset + LEAF_SIZE).min(shard.len());
            let leaf = &shard[offset..end];
            if skip >= leaf.len() {
                skip -= leaf.len();
                continue;
            }
            let leaf = &leaf[skip..];
            skip = 0;

            let n = leaf.len().min(remaining);
            out.write_all(&leaf[..n])?;
            remaining -= n;
            if remaining == 0 {
                return Ok(());
            }
        }
    }

    Err(TesseraError::InsufficientShards {
        available: length - remaining,
        required: length,
    })
}
