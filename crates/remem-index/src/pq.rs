//! Product quantizer
//!
//! Splits each embedding into `m` contiguous sub-vectors and replaces every
//! sub-vector by the index of its nearest codebook centroid (k-means, up to 256
//! centroids per subspace). Distances from a query to any stored code are then
//! table lookups (asymmetric distance computation), cheap enough to pre-rank
//! large candidate sets before exact re-scoring.

use std::collections::HashMap;
use std::ops::Range;

use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::SeedableRng;
use remem_common::ExperienceId;

use crate::distance::l2_squared;

/// Split `dimension` into `m` near-equal contiguous ranges
fn subspace_ranges(dimension: usize, m: usize) -> Vec<Range<usize>> {
    let m = m.clamp(1, dimension.max(1));
    let base = dimension / m;
    let extra = dimension % m;
    let mut start = 0;
    (0..m)
        .map(|i| {
            let len = base + usize::from(i < extra);
            let r = start..start + len;
            start += len;
            r
        })
        .collect()
}

/// Precomputed query-to-centroid distances
#[derive(Debug, Clone)]
pub struct DistanceTable {
    /// `table[sub][centroid]` squared distance
    table: Vec<Vec<f32>>,
}

impl DistanceTable {
    /// Approximate Euclidean distance to an encoded vector
    pub fn distance(&self, code: &[u8]) -> f32 {
        code.iter()
            .zip(&self.table)
            .map(|(c, row)| row.get(*c as usize).copied().unwrap_or(f32::MAX))
            .sum::<f32>()
            .sqrt()
    }
}

#[derive(Debug, Clone)]
pub struct ProductQuantizer {
    dimension: usize,
    ranges: Vec<Range<usize>>,
    centroids: usize,
    iterations: usize,
    /// `codebooks[sub][centroid]` sub-vector
    codebooks: Vec<Vec<Vec<f32>>>,
    codes: HashMap<ExperienceId, Vec<u8>>,
    seed: u64,
}

impl ProductQuantizer {
    pub fn new(
        dimension: usize,
        subspaces: usize,
        centroids: usize,
        iterations: usize,
        seed: u64,
    ) -> Self {
        Self {
            dimension,
            ranges: subspace_ranges(dimension, subspaces),
            centroids: centroids.clamp(1, 256),
            iterations: iterations.max(1),
            codebooks: Vec::new(),
            codes: HashMap::new(),
            seed,
        }
    }

    pub fn is_trained(&self) -> bool {
        !self.codebooks.is_empty()
    }

    /// Learn codebooks from `samples` and (re-)encode them.
    ///
    /// Previously stored codes are dropped; callers re-insert every live vector.
    pub fn train(&mut self, samples: &[(ExperienceId, &[f32])]) {
        if samples.is_empty() {
            return;
        }
        let mut rng = StdRng::seed_from_u64(self.seed);
        let k = self.centroids.min(samples.len());

        self.codebooks = self
            .ranges
            .iter()
            .map(|range| {
                let subs: Vec<&[f32]> = samples.iter().map(|(_, v)| &v[range.clone()]).collect();
                kmeans(&subs, k, self.iterations, &mut rng)
            })
            .collect();

        self.codes.clear();
        for (id, v) in samples {
            self.insert(*id, v);
        }
    }

    /// Encode a vector. `None` before training or on dimension mismatch.
    pub fn encode(&self, v: &[f32]) -> Option<Vec<u8>> {
        if !self.is_trained() || v.len() != self.dimension {
            return None;
        }
        Some(
            self.ranges
                .iter()
                .zip(&self.codebooks)
                .map(|(range, book)| nearest(book, &v[range.clone()]) as u8)
                .collect(),
        )
    }

    /// Store the code for `id` (no-op until trained)
    pub fn insert(&mut self, id: ExperienceId, v: &[f32]) {
        if let Some(code) = self.encode(v) {
            self.codes.insert(id, code);
        }
    }

    pub fn remove(&mut self, id: &ExperienceId) -> bool {
        self.codes.remove(id).is_some()
    }

    pub fn code(&self, id: &ExperienceId) -> Option<&[u8]> {
        self.codes.get(id).map(Vec::as_slice)
    }

    /// Build the lookup table for one query
    pub fn distance_table(&self, query: &[f32]) -> Option<DistanceTable> {
        if !self.is_trained() || query.len() != self.dimension {
            return None;
        }
        Some(DistanceTable {
            table: self
                .ranges
                .iter()
                .zip(&self.codebooks)
                .map(|(range, book)| {
                    let q = &query[range.clone()];
                    book.iter().map(|c| l2_squared(q, c)).collect()
                })
                .collect(),
        })
    }

    /// Approximate distance from a prepared table to a stored id
    pub fn approximate_distance(&self, table: &DistanceTable, id: &ExperienceId) -> Option<f32> {
        self.codes.get(id).map(|code| table.distance(code))
    }

    /// Mean reconstruction error over `samples` (diagnostics)
    pub fn reconstruction_error(&self, samples: &[&[f32]]) -> Option<f32> {
        if samples.is_empty() {
            return None;
        }
        let mut total = 0.0;
        for v in samples {
            let code = self.encode(v)?;
            let recon: Vec<f32> = code
                .iter()
                .zip(&self.codebooks)
                .flat_map(|(c, book)| book[*c as usize].iter().copied())
                .collect();
            total += l2_squared(v, &recon).sqrt();
        }
        Some(total / samples.len() as f32)
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    /// Bytes per encoded vector
    pub fn code_size(&self) -> usize {
        self.ranges.len()
    }
}

fn nearest(book: &[Vec<f32>], v: &[f32]) -> usize {
    book.iter()
        .enumerate()
        .map(|(i, c)| (i, l2_squared(v, c)))
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(i, _)| i)
        .unwrap_or(0)
}

/// Lloyd's k-means seeded with `k` distinct random samples
fn kmeans(points: &[&[f32]], k: usize, iterations: usize, rng: &mut StdRng) -> Vec<Vec<f32>> {
    let dim = points.first().map(|p| p.len()).unwrap_or(0);
    let mut centroids: Vec<Vec<f32>> = sample(rng, points.len(), k)
        .into_iter()
        .map(|i| points[i].to_vec())
        .collect();

    let mut assignment = vec![0usize; points.len()];
    for _ in 0..iterations {
        let mut changed = false;
        for (i, p) in points.iter().enumerate() {
            let c = nearest(&centroids, p);
            if assignment[i] != c {
                assignment[i] = c;
                changed = true;
            }
        }

        let mut sums = vec![vec![0.0f32; dim]; k];
        let mut counts = vec![0usize; k];
        for (p, &c) in points.iter().zip(&assignment) {
            counts[c] += 1;
            for (s, x) in sums[c].iter_mut().zip(p.iter()) {
                *s += x;
            }
        }
        for (c, (sum, count)) in sums.into_iter().zip(counts).enumerate() {
            // Empty clusters keep their previous centroid
            if count > 0 {
                centroids[c] = sum.into_iter().map(|s| s / count as f32).collect();
            }
        }

        if !changed {
            break;
        }
    }

    centroids
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn random_vectors(n: usize, dim: usize, seed: u64) -> Vec<Vec<f32>> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect())
            .collect()
    }

    #[test]
    fn test_subspace_ranges_cover_dimension() {
        let ranges = subspace_ranges(10, 3);
        assert_eq!(ranges, vec![0..4, 4..7, 7..10]);
        assert_eq!(subspace_ranges(4, 8).len(), 4);
    }

    #[test]
    fn test_untrained_quantizer_encodes_nothing() {
        let mut pq = ProductQuantizer::new(8, 4, 16, 5, 1);
        pq.insert(ExperienceId::new(), &[0.0; 8]);
        assert!(pq.is_empty());
        assert!(pq.distance_table(&[0.0; 8]).is_none());
    }

    #[test]
    fn test_adc_preserves_nearest_neighbour_ordering() {
        let vectors = random_vectors(300, 16, 4);
        let ids: Vec<_> = (0..vectors.len()).map(|_| ExperienceId::new()).collect();
        let samples: Vec<_> = ids
            .iter()
            .copied()
            .zip(vectors.iter().map(|v| v.as_slice()))
            .collect();

        let mut pq = ProductQuantizer::new(16, 4, 32, 10, 7);
        pq.train(&samples);
        assert!(pq.is_trained());
        assert_eq!(pq.len(), 300);
        assert_eq!(pq.code_size(), 4);

        // The exact vector should rank in the top 5 by approximate distance
        let mut hits = 0;
        for (q_idx, query) in vectors.iter().enumerate().take(50) {
            let table = pq.distance_table(query).unwrap();
            let mut ranked: Vec<_> = ids
                .iter()
                .map(|id| (*id, pq.approximate_distance(&table, id).unwrap()))
                .collect();
            ranked.sort_by(|a, b| a.1.total_cmp(&b.1));
            if ranked.iter().take(5).any(|(id, _)| *id == ids[q_idx]) {
                hits += 1;
            }
        }
        assert!(hits >= 45, "hits {}", hits);
    }

    #[test]
    fn test_reconstruction_error_below_spread() {
        let vectors = random_vectors(200, 8, 9);
        let samples: Vec<_> = vectors.iter().map(|v| (ExperienceId::new(), v.as_slice())).collect();
        let mut pq = ProductQuantizer::new(8, 4, 16, 10, 3);
        pq.train(&samples);

        let refs: Vec<&[f32]> = vectors.iter().map(|v| v.as_slice()).collect();
        let err = pq.reconstruction_error(&refs).unwrap();
        // Mean distance between random points in [-1,1]^8 is ~1.6
        assert!(err < 1.0, "reconstruction error {}", err);
    }
}
