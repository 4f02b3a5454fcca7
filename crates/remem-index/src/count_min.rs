//! Count-Min frequency sketch
//!
//! Approximate counts with one-sided error: an estimate is never below the true
//! count, and exceeds it by at most `e / width * total` with probability
//! `1 - e^-depth`.

use crate::hashing::{derive_seed, hash_pair, nth_position};

/// Count-Min sketch with saturating `u32` cells
#[derive(Debug, Clone)]
pub struct CountMinSketch {
    width: usize,
    depth: usize,
    table: Vec<u32>,
    row_seeds: Vec<u64>,
    total: u64,
}

impl CountMinSketch {
    pub fn new(width: usize, depth: usize, seed: u64) -> Self {
        let width = width.max(1);
        let depth = depth.max(1);
        let row_seeds = (0..depth)
            .map(|row| derive_seed(seed, &format!("cms-row-{}", row)))
            .collect();

        Self {
            width,
            depth,
            table: vec![0; width * depth],
            row_seeds,
            total: 0,
        }
    }

    #[inline]
    fn cell(&self, row: usize, key: &[u8]) -> usize {
        let (h1, h2) = hash_pair(self.row_seeds[row], key);
        row * self.width + nth_position(h1, h2, 0, self.width)
    }

    /// Add `by` occurrences of `key`
    pub fn increment(&mut self, key: &[u8], by: u32) {
        for row in 0..self.depth {
            let idx = self.cell(row, key);
            self.table[idx] = self.table[idx].saturating_add(by);
        }
        self.total = self.total.saturating_add(by as u64);
    }

    /// Estimated count (never an underestimate)
    pub fn estimate(&self, key: &[u8]) -> u32 {
        (0..self.depth)
            .map(|row| self.table[self.cell(row, key)])
            .min()
            .unwrap_or(0)
    }

    /// Total increments recorded
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Upper bound on the additive overestimate (`e / width * total`)
    pub fn error_bound(&self) -> f64 {
        std::f64::consts::E / self.width as f64 * self.total as f64
    }

    pub fn clear(&mut self) {
        self.table.iter_mut().for_each(|c| *c = 0);
        self.total = 0;
    }
}
