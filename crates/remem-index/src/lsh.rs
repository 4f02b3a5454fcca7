//! Bucket-hash index (random-hyperplane LSH)
//!
//! Each table hashes an embedding to a `bits`-wide signature, one bit per
//! random hyperplane (sign of the projection). Vectors with small angular
//! distance collide in at least one table with high probability. Queries can
//! additionally visit the buckets reached by flipping the least-confident bits.

use std::collections::{HashMap, HashSet};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use remem_common::ExperienceId;

use crate::distance::dot;

/// Standard normal sample (Box-Muller)
fn gaussian(rng: &mut StdRng) -> f32 {
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.gen();
    ((-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()) as f32
}

#[derive(Debug, Clone)]
struct LshTable {
    planes: Vec<Vec<f32>>,
    buckets: HashMap<u64, Vec<ExperienceId>>,
}

impl LshTable {
    fn new(dimension: usize, bits: usize, rng: &mut StdRng) -> Self {
        let planes = (0..bits)
            .map(|_| (0..dimension).map(|_| gaussian(rng)).collect())
            .collect();
        Self {
            planes,
            buckets: HashMap::new(),
        }
    }

    /// Signature plus the per-bit projection magnitudes
    fn project(&self, embedding: &[f32]) -> (u64, Vec<f32>) {
        let mut signature = 0u64;
        let mut margins = Vec::with_capacity(self.planes.len());
        for (bit, plane) in self.planes.iter().enumerate() {
            let p = dot(plane, embedding);
            if p >= 0.0 {
                signature |= 1u64 << bit;
            }
            margins.push(p.abs());
        }
        (signature, margins)
    }
}

/// Multi-table LSH index over experience embeddings
#[derive(Debug, Clone)]
pub struct LshIndex {
    tables: Vec<LshTable>,
    /// Signature per table for every indexed id (needed for removal)
    signatures: HashMap<ExperienceId, Vec<u64>>,
}

impl LshIndex {
    /// `bits` is capped at 64
    pub fn new(dimension: usize, num_tables: usize, bits: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let bits = bits.clamp(1, 64);
        let tables = (0..num_tables.max(1))
            .map(|_| LshTable::new(dimension, bits, &mut rng))
            .collect();
        Self {
            tables,
            signatures: HashMap::new(),
        }
    }

    pub fn insert(&mut self, id: ExperienceId, embedding: &[f32]) {
        if self.signatures.contains_key(&id) {
            return;
        }
        let mut sigs = Vec::with_capacity(self.tables.len());
        for table in &mut self.tables {
            let (sig, _) = table.project(embedding);
            table.buckets.entry(sig).or_default().push(id);
            sigs.push(sig);
        }
        self.signatures.insert(id, sigs);
    }

    pub fn remove(&mut self, id: &ExperienceId) -> bool {
        let Some(sigs) = self.signatures.remove(id) else {
            return false;
        };
        for (table, sig) in self.tables.iter_mut().zip(sigs) {
            if let Some(bucket) = table.buckets.get_mut(&sig) {
                bucket.retain(|x| x != id);
                if bucket.is_empty() {
                    table.buckets.remove(&sig);
                }
            }
        }
        true
    }

    /// Union of colliding ids across all tables.
    ///
    /// `flips` extra buckets per table are visited by flipping the bits whose
    /// hyperplane the query lies closest to.
    pub fn candidates(&self, embedding: &[f32], flips: usize) -> Vec<ExperienceId> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();

        for table in &self.tables {
            let (sig, margins) = table.project(embedding);

            let mut order: Vec<usize> = (0..margins.len()).collect();
            order.sort_by(|a, b| margins[*a].total_cmp(&margins[*b]));

            let neighbour_sigs = std::iter::once(sig)
                .chain(order.into_iter().take(flips).map(|bit| sig ^ (1u64 << bit)));

            for neighbour in neighbour_sigs {
                if let Some(bucket) = table.buckets.get(&neighbour) {
                    for id in bucket {
                        if seen.insert(*id) {
                            out.push(*id);
                        }
                    }
                }
            }
        }

        out
    }

    pub fn contains(&self, id: &ExperienceId) -> bool {
        self.signatures.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }

    pub fn num_tables(&self) -> usize {
        self.tables.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distance::normalize;

    fn random_unit(rng: &mut StdRng, dim: usize) -> Vec<f32> {
        let mut v: Vec<f32> = (0..dim).map(|_| gaussian(rng)).collect();
        normalize(&mut v);
        v
    }

    #[test]
    fn test_identical_vector_always_collides() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut index = LshIndex::new(16, 6, 10, 7);
        let vectors: Vec<_> = (0..200).map(|_| random_unit(&mut rng, 16)).collect();
        let ids: Vec<_> = vectors
            .iter()
            .map(|v| {
                let id = ExperienceId::new();
                index.insert(id, v);
                id
            })
            .collect();

        for (id, v) in ids.iter().zip(&vectors) {
            assert!(index.candidates(v, 0).contains(id));
        }
    }

    #[test]
    fn test_near_neighbours_recalled_over_trials() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut hits = 0;
        let trials = 50;
        for trial in 0..trials {
            let mut index = LshIndex::new(32, 8, 8, trial);
            let base = random_unit(&mut rng, 32);
            let id = ExperienceId::new();
            index.insert(id, &base);
            for _ in 0..100 {
                index.insert(ExperienceId::new(), &random_unit(&mut rng, 32));
            }

            // Small perturbation of the stored vector
            let mut query: Vec<f32> = base.iter().map(|x| x + 0.05 * gaussian(&mut rng)).collect();
            normalize(&mut query);

            if index.candidates(&query, 2).contains(&id) {
                hits += 1;
            }
        }
        assert!(hits as f64 / trials as f64 >= 0.9, "recall {}/{}", hits, trials);
    }

    #[test]
    fn test_remove() {
        let mut index = LshIndex::new(4, 2, 4, 3);
        let id = ExperienceId::new();
        let v = [1.0, 0.0, 0.0, 0.0];
        index.insert(id, &v);
        assert!(index.remove(&id));
        assert!(!index.remove(&id));
        assert!(index.candidates(&v, 1).is_empty());
        assert!(index.is_empty());
    }
}
