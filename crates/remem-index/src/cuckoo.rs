//! Deletable membership filter (cuckoo filter)
//!
//! Partial-key cuckoo hashing with 16-bit fingerprints and 4-slot buckets.
//! Supports O(1) insert, lookup and delete. Used to track experiences that were
//! recently served but did not help, so the retriever can down-weight them.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::hashing::hash_pair;

const SLOTS: usize = 4;
const EMPTY: u16 = 0;

/// Insertion failed: the filter is at capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterFull;

#[derive(Debug, Clone)]
pub struct CuckooFilter {
    buckets: Vec<[u16; SLOTS]>,
    mask: usize,
    max_kicks: usize,
    seed: u64,
    len: usize,
    /// Fingerprint displaced by the last failed kick chain
    stash: Option<(usize, u16)>,
    rng: StdRng,
}

impl CuckooFilter {
    /// Create a filter able to hold roughly `capacity` keys
    pub fn new(capacity: usize, seed: u64) -> Self {
        let num_buckets = (capacity.max(SLOTS) / SLOTS).next_power_of_two();
        Self {
            buckets: vec![[EMPTY; SLOTS]; num_buckets],
            mask: num_buckets - 1,
            max_kicks: 500,
            seed,
            len: 0,
            stash: None,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn fingerprint_and_index(&self, key: &[u8]) -> (u16, usize) {
        let (h1, h2) = hash_pair(self.seed, key);
        let fp = (h1 >> 48) as u16;
        let fp = if fp == EMPTY { 1 } else { fp };
        (fp, (h2 as usize) & self.mask)
    }

    fn alt_index(&self, index: usize, fp: u16) -> usize {
        let (h, _) = hash_pair(self.seed, &fp.to_le_bytes());
        (index ^ h as usize) & self.mask
    }

    fn try_place(&mut self, index: usize, fp: u16) -> bool {
        if let Some(slot) = self.buckets[index].iter_mut().find(|s| **s == EMPTY) {
            *slot = fp;
            return true;
        }
        false
    }

    /// Insert a key. Duplicate inserts store duplicate fingerprints.
    pub fn insert(&mut self, key: &[u8]) -> Result<(), FilterFull> {
        if self.stash.is_some() {
            return Err(FilterFull);
        }

        let (fp, i1) = self.fingerprint_and_index(key);
        let i2 = self.alt_index(i1, fp);

        if self.try_place(i1, fp) || self.try_place(i2, fp) {
            self.len += 1;
            return Ok(());
        }

        let mut index = if self.rng.gen::<bool>() { i1 } else { i2 };
        let mut fp = fp;
        for _ in 0..self.max_kicks {
            let slot = self.rng.gen_range(0..SLOTS);
            std::mem::swap(&mut fp, &mut self.buckets[index][slot]);
            index = self.alt_index(index, fp);
            if self.try_place(index, fp) {
                self.len += 1;
                return Ok(());
            }
        }

        // The displaced fingerprint is kept so no earlier key is lost
        self.stash = Some((index, fp));
        self.len += 1;
        Ok(())
    }

    /// Test a key
    pub fn contains(&self, key: &[u8]) -> bool {
        let (fp, i1) = self.fingerprint_and_index(key);
        let i2 = self.alt_index(i1, fp);

        if let Some((si, sfp)) = self.stash {
            if sfp == fp && (si == i1 || si == i2) {
                return true;
            }
        }

        self.buckets[i1].contains(&fp) || self.buckets[i2].contains(&fp)
    }

    /// Delete one occurrence of a key. Returns whether it was present.
    pub fn remove(&mut self, key: &[u8]) -> bool {
        let (fp, i1) = self.fingerprint_and_index(key);
        let i2 = self.alt_index(i1, fp);

        if let Some((si, sfp)) = self.stash {
            if sfp == fp && (si == i1 || si == i2) {
                self.stash = None;
                self.len -= 1;
                return true;
            }
        }

        for index in [i1, i2] {
            if let Some(slot) = self.buckets[index].iter_mut().find(|s| **s == fp) {
                *slot = EMPTY;
                self.len -= 1;
                self.reinsert_stash();
                return true;
            }
        }
        false
    }

    fn reinsert_stash(&mut self) {
        if let Some((index, fp)) = self.stash {
            let alt = self.alt_index(index, fp);
            if self.try_place(index, fp) || self.try_place(alt, fp) {
                self.stash = None;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Total slot capacity
    pub fn capacity(&self) -> usize {
        self.buckets.len() * SLOTS
    }

    pub fn clear(&mut self) {
        self.buckets.iter_mut().for_each(|b| *b = [EMPTY; SLOTS]);
        self.stash = None;
        self.len = 0;
    }
}
