//! Bloom filter for fast key existence checks.

use crate::error::Result;
use std::io::{Read, Write};

/// Default number of hash functions.
const BLOOM_DEFAULT_HASH_COUNT: u8 = 3;

/// Bloom filter over opaque byte keys.
///
/// Uses xxhash64 with k seeded hash functions:
/// `h_i(x) = xxhash64(x, seed=i) % size_bits`.
#[derive(Debug, Clone)]
pub struct BloomFilter {
    /// Bit array for the filter.
    bits: Vec<u64>,
    /// Number of hash functions to use.
    hash_count: u8,
}

impl BloomFilter {
    /// Creates a filter sized for the given number of keys.
    ///
    /// Uses approximately 10 bits per key, which gives roughly a 1%
    /// false positive rate with k=3 hash functions.
    pub fn new(expected_items: usize) -> Self {
        let num_bits = (expected_items * 10).max(64);
        let num_words = num_bits.div_ceil(64);

        Self {
            bits: vec![0u64; num_words],
            hash_count: BLOOM_DEFAULT_HASH_COUNT,
        }
    }

    /// Adds a key to the filter.
    pub fn insert(&mut self, key: &[u8]) {
        let num_bits = self.bits.len() * 64;

        for seed in 0..self.hash_count {
            let hash = xxhash_rust::xxh64::xxh64(key, u64::from(seed));
            let bit_idx = hash % (num_bits as u64);
            let word_idx = (bit_idx / 64) as usize;
            let bit_pos = bit_idx % 64;
            self.bits[word_idx] |= 1u64 << bit_pos;
        }
    }

    /// Checks whether a key might be in the filter.
    ///
    /// Returns `true` if the key might be present (false positives are
    /// possible) and `false` if it is definitely absent.
    pub fn maybe_contains(&self, key: &[u8]) -> bool {
        let num_bits = self.bits.len() * 64;

        for seed in 0..self.hash_count {
            let hash = xxhash_rust::xxh64::xxh64(key, u64::from(seed));
            let bit_idx = hash % (num_bits as u64);
            let word_idx = (bit_idx / 64) as usize;
            let bit_pos = bit_idx % 64;
            if self.bits[word_idx] & (1u64 << bit_pos) == 0 {
                return false;
            }
        }

        true
    }

    /// Writes the filter to a writer.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        // Number of words (4 bytes)
        writer.write_all(&(self.bits.len() as u32).to_le_bytes())?;
        // Hash count (1 byte) + 3 bytes reserved for alignment
        writer.write_all(&[self.hash_count, 0, 0, 0])?;
        // Bit array
        for word in &self.bits {
            writer.write_all(&word.to_le_bytes())?;
        }
        Ok(())
    }

    /// Reads a filter from a reader.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        // Number of words (4 bytes)
        let mut buf4 = [0u8; 4];
        reader.read_exact(&mut buf4)?;
        let num_words = u32::from_le_bytes(buf4) as usize;

        // Hash count (1 byte) + 3 bytes reserved
        reader.read_exact(&mut buf4)?;
        let hash_count = buf4[0];

        // Bit array
        let mut bits = Vec::with_capacity(num_words);
        let mut buf8 = [0u8; 8];
        for _ in 0..num_words {
            reader.read_exact(&mut buf8)?;
            bits.push(u64::from_le_bytes(buf8));
        }

        Ok(Self { bits, hash_count })
    }
}
