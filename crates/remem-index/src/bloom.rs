//! Exact-membership Bloom filter
//!
//! Answers "have we seen this normalised task text before" in O(k). False
//! positives are possible; false negatives are not for keys inserted into this
//! filter. Keys cannot be removed, so evicted tasks keep testing positive until
//! the shard is rebuilt.

use crate::hashing::{hash_pair, nth_position};

/// Classic bit-array Bloom filter with double hashing
#[derive(Debug, Clone)]
pub struct BloomFilter {
    bits: Vec<u64>,
    num_bits: usize,
    num_hashes: u32,
    seed: u64,
    items: usize,
}

impl BloomFilter {
    /// Size the filter for `capacity` keys at the target false-positive rate
    pub fn with_rate(capacity: usize, fp_rate: f64, seed: u64) -> Self {
        let n = capacity.max(1) as f64;
        let p = fp_rate.clamp(1e-9, 0.5);
        let ln2 = std::f64::consts::LN_2;

        let num_bits = ((-n * p.ln()) / (ln2 * ln2)).ceil().max(64.0) as usize;
        let num_hashes = ((num_bits as f64 / n) * ln2).round().clamp(1.0, 16.0) as u32;

        Self {
            bits: vec![0u64; num_bits.div_ceil(64)],
            num_bits,
            num_hashes,
            seed,
            items: 0,
        }
    }

    /// Insert a key
    pub fn insert(&mut self, key: &[u8]) {
        let (h1, h2) = hash_pair(self.seed, key);
        for i in 0..self.num_hashes as u64 {
            let bit = nth_position(h1, h2, i, self.num_bits);
            self.bits[bit / 64] |= 1u64 << (bit % 64);
        }
        self.items += 1;
    }

    /// Test a key. `false` is definitive.
    pub fn contains(&self, key: &[u8]) -> bool {
        let (h1, h2) = hash_pair(self.seed, key);
        (0..self.num_hashes as u64).all(|i| {
            let bit = nth_position(h1, h2, i, self.num_bits);
            self.bits[bit / 64] & (1u64 << (bit % 64)) != 0
        })
    }

    /// Number of insertions so far
    pub fn len(&self) -> usize {
        self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items == 0
    }

    /// Expected false-positive rate at the current fill
    pub fn estimated_fp_rate(&self) -> f64 {
        let k = self.num_hashes as f64;
        let m = self.num_bits as f64;
        let n = self.items as f64;
        (1.0 - (-k * n / m).exp()).powf(k)
    }

    /// Reset every bit
    pub fn clear(&mut self) {
        self.bits.iter_mut().for_each(|w| *w = 0);
        self.items = 0;
    }
}
