//! Per-shard index set
//!
//! Bundles the six cooperating structures over the experiences visible in one
//! shard (an agent, a tier, or the collective). Every entry is derivative: the
//! whole set can be rebuilt from store records alone.
//!
//! | Structure | Role |
//! |---|---|
//! | [`BloomFilter`] | exact-duplicate task fast path |
//! | [`LshIndex`] | O(1) candidate buckets |
//! | [`ProductQuantizer`] | cheap approximate distances for pre-ranking |
//! | [`Hnsw`] | O(log n) approximate nearest neighbours |
//! | [`CountMinSketch`] | retrieval popularity per id |
//! | [`CuckooFilter`] | deletable "recently unhelpful" flags |

use std::collections::{HashMap, HashSet};

use remem_common::ExperienceId;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::bloom::BloomFilter;
use crate::count_min::CountMinSketch;
use crate::cuckoo::CuckooFilter;
use crate::distance::l2;
use crate::hashing::derive_seed;
use crate::hnsw::{Hnsw, HnswParams};
use crate::lsh::LshIndex;
use crate::pq::ProductQuantizer;

/// Tuning for every structure in an index set
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Base seed for all randomised structures
    pub seed: u64,
    /// Number of LSH tables
    pub lsh_tables: usize,
    /// Hyperplanes per LSH table (max 64)
    pub lsh_bits: usize,
    /// Extra buckets visited per table
    pub lsh_bit_flips: usize,
    /// PQ subspaces
    pub pq_subspaces: usize,
    /// PQ centroids per subspace (max 256)
    pub pq_centroids: usize,
    /// Live vectors required before the quantizer is trained
    pub pq_train_threshold: usize,
    /// k-means iterations
    pub pq_iterations: usize,
    /// Candidates kept after PQ pre-ranking, as a multiple of the requested k
    pub pq_rescore_factor: usize,
    /// HNSW max neighbours per node
    pub hnsw_m: usize,
    /// HNSW beam width while inserting
    pub hnsw_ef_construction: usize,
    /// HNSW fixed global entry points
    pub hnsw_global_entries: usize,
    /// Expected distinct tasks per shard
    pub bloom_capacity: usize,
    /// Bloom false-positive target
    pub bloom_fp_rate: f64,
    /// Count-Min columns
    pub sketch_width: usize,
    /// Count-Min rows
    pub sketch_depth: usize,
    /// Cuckoo filter capacity
    pub cuckoo_capacity: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            seed: 0x5eed_1dea,
            lsh_tables: 8,
            lsh_bits: 12,
            lsh_bit_flips: 2,
            pq_subspaces: 8,
            pq_centroids: 16,
            pq_train_threshold: 256,
            pq_iterations: 8,
            pq_rescore_factor: 4,
            hnsw_m: 12,
            hnsw_ef_construction: 64,
            hnsw_global_entries: 4,
            bloom_capacity: 100_000,
            bloom_fp_rate: 0.01,
            sketch_width: 2048,
            sketch_depth: 4,
            cuckoo_capacity: 4096,
        }
    }
}

/// One record as seen by the index set
#[derive(Debug, Clone, Copy)]
pub struct IndexEntry<'a> {
    pub id: ExperienceId,
    /// Normalised task text
    pub task_key: &'a str,
    pub embedding: &'a [f32],
    /// Seeds the popularity sketch on rebuild
    pub usage_count: u64,
}

/// Approximate neighbour with its exact distance
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub id: ExperienceId,
    pub distance: f32,
}

/// Statistics about an index set
#[derive(Debug, Clone)]
pub struct IndexStats {
    pub entries: usize,
    pub tombstones: usize,
    pub lsh_tables: usize,
    pub pq_trained: bool,
    pub hnsw_max_level: usize,
    pub bloom_fp_rate: f64,
    pub unhelpful_flags: usize,
    pub dirty: bool,
}

/// Tombstones tolerated before the graph is compacted, at minimum
const COMPACTION_FLOOR: usize = 32;

pub struct IndexSet {
    config: IndexConfig,
    dimension: usize,
    shard_seed: u64,
    membership: BloomFilter,
    /// Exact task key → most recent id with that task
    task_keys: HashMap<String, ExperienceId>,
    lsh: LshIndex,
    pq: ProductQuantizer,
    graph: Hnsw,
    popularity: CountMinSketch,
    unhelpful: CuckooFilter,
    /// Ids actually inserted into `unhelpful`; only these are ever deleted
    flagged: HashSet<ExperienceId>,
    dirty: bool,
}

impl IndexSet {
    /// Create an empty set. `seed` distinguishes shards.
    pub fn new(dimension: usize, config: &IndexConfig, seed: u64) -> Self {
        let base = config.seed ^ seed;
        Self {
            config: config.clone(),
            dimension,
            shard_seed: seed,
            membership: BloomFilter::with_rate(
                config.bloom_capacity,
                config.bloom_fp_rate,
                derive_seed(base, "bloom"),
            ),
            task_keys: HashMap::new(),
            lsh: LshIndex::new(
                dimension,
                config.lsh_tables,
                config.lsh_bits,
                derive_seed(base, "lsh"),
            ),
            pq: ProductQuantizer::new(
                dimension,
                config.pq_subspaces,
                config.pq_centroids,
                config.pq_iterations,
                derive_seed(base, "pq"),
            ),
            graph: Hnsw::new(
                HnswParams {
                    m: config.hnsw_m,
                    ef_construction: config.hnsw_ef_construction,
                    global_entries: config.hnsw_global_entries,
                },
                derive_seed(base, "hnsw"),
            ),
            popularity: CountMinSketch::new(
                config.sketch_width,
                config.sketch_depth,
                derive_seed(base, "sketch"),
            ),
            unhelpful: CuckooFilter::new(config.cuckoo_capacity, derive_seed(base, "cuckoo")),
            flagged: HashSet::new(),
            dirty: false,
        }
    }

    /// Index one record. Wrong-dimension embeddings are skipped.
    pub fn insert(&mut self, entry: IndexEntry<'_>) {
        if entry.embedding.len() != self.dimension {
            warn!(
                id = %entry.id,
                expected = self.dimension,
                actual = entry.embedding.len(),
                "Skipping index insert with wrong embedding dimension"
            );
            return;
        }
        if self.graph.contains(&entry.id) {
            return;
        }

        self.membership.insert(entry.task_key.as_bytes());
        self.task_keys.insert(entry.task_key.to_string(), entry.id);
        self.lsh.insert(entry.id, entry.embedding);
        self.graph.insert(entry.id, entry.embedding.to_vec());

        if self.pq.is_trained() {
            self.pq.insert(entry.id, entry.embedding);
        } else if self.graph.len() >= self.config.pq_train_threshold {
            self.train_quantizer();
        }
    }

    fn train_quantizer(&mut self) {
        let samples: Vec<(ExperienceId, &[f32])> = self.graph.live_vectors().collect();
        debug!(samples = samples.len(), "Training product quantizer");
        self.pq.train(&samples);
    }

    /// Drop a record from every structure that supports deletion.
    ///
    /// The Bloom filter keeps the task key; the fast path tolerates the miss.
    /// Once graph tombstones outnumber live nodes the graph is compacted.
    pub fn remove(&mut self, id: &ExperienceId, task_key: &str) {
        if self.task_keys.get(task_key) == Some(id) {
            self.task_keys.remove(task_key);
        }
        self.lsh.remove(id);
        self.pq.remove(id);
        self.clear_unhelpful(id);

        if self.graph.remove(id)
            && self.graph.tombstones() > self.graph.len().max(COMPACTION_FLOOR)
        {
            debug!(
                live = self.graph.len(),
                tombstones = self.graph.tombstones(),
                "Compacting proximity graph"
            );
            self.graph.compact();
        }
    }

    /// Exact-duplicate fast path: the id last stored under this task key
    pub fn exact_match(&self, task_key: &str) -> Option<ExperienceId> {
        if !self.membership.contains(task_key.as_bytes()) {
            return None;
        }
        self.task_keys.get(task_key).copied()
    }

    /// Bucket-hash candidates across all tables
    pub fn lsh_candidates(&self, embedding: &[f32]) -> Vec<ExperienceId> {
        if embedding.len() != self.dimension {
            return Vec::new();
        }
        self.lsh.candidates(embedding, self.config.lsh_bit_flips)
    }

    /// Graph refinement: seeded beam search under PQ distances, then exact
    /// re-scoring of the top `k * pq_rescore_factor` slice.
    pub fn refine(
        &self,
        query: &[f32],
        seeds: &[ExperienceId],
        k: usize,
        ef: usize,
    ) -> Vec<Neighbor> {
        if query.len() != self.dimension || k == 0 {
            return Vec::new();
        }

        let table = self.pq.distance_table(query);
        let slice = k.saturating_mul(self.config.pq_rescore_factor.max(1));

        let approx = self.graph.search_with(seeds, slice, ef.max(slice), |id, v| {
            table
                .as_ref()
                .and_then(|t| self.pq.approximate_distance(t, &id))
                .unwrap_or_else(|| l2(query, v))
        });

        let mut exact: Vec<Neighbor> = approx
            .into_iter()
            .filter_map(|(id, _)| {
                self.graph.vector(&id).map(|v| Neighbor {
                    id,
                    distance: l2(query, v),
                })
            })
            .collect();
        exact.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        exact.truncate(k);
        exact
    }

    /// Exact distance to an indexed record
    pub fn distance_to(&self, query: &[f32], id: &ExperienceId) -> Option<f32> {
        self.graph.vector(id).map(|v| l2(query, v))
    }

    /// Count one retrieval of `id`
    pub fn record_retrieval(&mut self, id: &ExperienceId) {
        self.popularity.increment(id.as_bytes(), 1);
    }

    /// Approximate retrieval count of an id
    pub fn popularity(&self, id: &ExperienceId) -> u32 {
        self.popularity.estimate(id.as_bytes())
    }

    /// Flag an id as recently unhelpful. Idempotent.
    pub fn flag_unhelpful(&mut self, id: &ExperienceId) {
        if self.flagged.contains(id) {
            return;
        }
        if self.unhelpful.insert(id.as_bytes()).is_err() {
            warn!(
                flags = self.unhelpful.len(),
                "Unhelpful filter full, resetting"
            );
            self.unhelpful.clear();
            self.flagged.clear();
            // A fresh filter always has room
            let _ = self.unhelpful.insert(id.as_bytes());
        }
        self.flagged.insert(*id);
    }

    /// Clear the unhelpful flag of an id.
    ///
    /// Ids that were never flagged are left alone: deleting an absent key
    /// from the cuckoo filter erases any colliding fingerprint of another id.
    pub fn clear_unhelpful(&mut self, id: &ExperienceId) -> bool {
        self.flagged.remove(id) && self.unhelpful.remove(id.as_bytes())
    }

    pub fn is_unhelpful(&self, id: &ExperienceId) -> bool {
        self.unhelpful.contains(id.as_bytes())
    }

    pub fn contains(&self, id: &ExperienceId) -> bool {
        self.graph.contains(id)
    }

    /// Live indexed records
    pub fn len(&self) -> usize {
        self.graph.len()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.is_empty()
    }

    /// Flag for lazy repair after a detected inconsistency
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Rebuild every structure from `entries`.
    ///
    /// Popularity is re-seeded from usage counts; unhelpful flags survive
    /// (stale ids are harmless).
    pub fn rebuild<'a>(&mut self, entries: impl IntoIterator<Item = IndexEntry<'a>>) {
        let mut fresh = IndexSet::new(self.dimension, &self.config, self.shard_seed);
        std::mem::swap(&mut fresh.unhelpful, &mut self.unhelpful);
        std::mem::swap(&mut fresh.flagged, &mut self.flagged);

        let mut count = 0usize;
        for entry in entries {
            fresh.insert(entry);
            let usage = entry.usage_count.min(u32::MAX as u64) as u32;
            if usage > 0 {
                fresh.popularity.increment(entry.id.as_bytes(), usage);
            }
            count += 1;
        }

        debug!(entries = count, "Index set rebuilt");
        *self = fresh;
    }

    pub fn stats(&self) -> IndexStats {
        IndexStats {
            entries: self.graph.len(),
            tombstones: self.graph.tombstones(),
            lsh_tables: self.lsh.num_tables(),
            pq_trained: self.pq.is_trained(),
            hnsw_max_level: self.graph.max_level(),
            bloom_fp_rate: self.membership.estimated_fp_rate(),
            unhelpful_flags: self.unhelpful.len(),
            dirty: self.dirty,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distance::normalize;
    use rand::rngs::StdRng;
    use std::collections::VecDeque;
    use rand::{Rng, SeedableRng};

    fn small_config() -> IndexConfig {
        IndexConfig {
            pq_train_threshold: 64,
            bloom_capacity: 1000,
            ..IndexConfig::default()
        }
    }

    fn random_unit(rng: &mut StdRng, dim: usize) -> Vec<f32> {
        let mut v: Vec<f32> = (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect();
        normalize(&mut v);
        v
    }

    fn populate(set: &mut IndexSet, n: usize, dim: usize) -> Vec<(ExperienceId, String, Vec<f32>)> {
        let mut rng = StdRng::seed_from_u64(17);
        let data: Vec<_> = (0..n)
            .map(|i| (ExperienceId::new(), format!("task {}", i), random_unit(&mut rng, dim)))
            .collect();
        for (id, key, v) in &data {
            set.insert(IndexEntry {
                id: *id,
                task_key: key,
                embedding: v,
                usage_count: 0,
            });
        }
        data
    }

    #[test]
    fn test_exact_match_fast_path() {
        let mut set = IndexSet::new(16, &small_config(), 1);
        let data = populate(&mut set, 50, 16);
        assert_eq!(set.exact_match("task 7"), Some(data[7].0));
        assert_eq!(set.exact_match("never stored"), None);
    }

    #[test]
    fn test_refine_finds_exact_vector_after_pq_training() {
        let mut set = IndexSet::new(16, &small_config(), 2);
        let data = populate(&mut set, 300, 16);
        assert!(set.stats().pq_trained);

        for (id, _, v) in data.iter().step_by(30) {
            let seeds = set.lsh_candidates(v);
            assert!(seeds.contains(id));
            let neighbors = set.refine(v, &seeds, 3, 32);
            assert_eq!(neighbors[0].id, *id);
            assert!(neighbors[0].distance < 1e-5);
        }
    }

    #[test]
    fn test_remove_clears_structures() {
        let mut set = IndexSet::new(8, &small_config(), 3);
        let data = populate(&mut set, 20, 8);
        let (id, key, v) = &data[4];
        set.flag_unhelpful(id);
        set.remove(id, key);

        assert!(!set.contains(id));
        assert!(!set.is_unhelpful(id));
        assert_eq!(set.exact_match(key), None);
        assert!(set.refine(v, &[*id], 5, 16).iter().all(|n| n.id != *id));
        assert_eq!(set.len(), 19);
    }

    #[test]
    fn test_popularity_and_unhelpful_flags() {
        let mut set = IndexSet::new(8, &small_config(), 4);
        let data = populate(&mut set, 5, 8);
        let (id, _, _) = &data[0];

        for _ in 0..3 {
            set.record_retrieval(id);
        }
        assert!(set.popularity(id) >= 3);

        set.flag_unhelpful(id);
        set.flag_unhelpful(id);
        assert!(set.is_unhelpful(id));
        assert_eq!(set.stats().unhelpful_flags, 1);
        assert!(set.clear_unhelpful(id));
        assert!(!set.is_unhelpful(id));
    }

    #[test]
    fn test_rebuild_drops_tombstones_and_reseeds_popularity() {
        let mut set = IndexSet::new(8, &small_config(), 5);
        let data = populate(&mut set, 30, 8);
        set.remove(&data[0].0, &data[0].1);
        set.mark_dirty();
        assert_eq!(set.stats().tombstones, 1);

        set.rebuild(data.iter().skip(1).map(|(id, key, v)| IndexEntry {
            id: *id,
            task_key: key,
            embedding: v,
            usage_count: 4,
        }));

        let stats = set.stats();
        assert_eq!(stats.entries, 29);
        assert_eq!(stats.tombstones, 0);
        assert!(!stats.dirty);
        assert!(set.popularity(&data[1].0) >= 4);
        assert_eq!(set.exact_match(&data[5].1), Some(data[5].0));
    }

    #[test]
    fn test_churn_keeps_tombstones_bounded() {
        let mut set = IndexSet::new(8, &small_config(), 7);
        let mut rng = StdRng::seed_from_u64(23);
        let mut live: VecDeque<(ExperienceId, String, Vec<f32>)> = VecDeque::new();

        for i in 0..2000 {
            let entry = (ExperienceId::new(), format!("churn {}", i), random_unit(&mut rng, 8));
            set.insert(IndexEntry {
                id: entry.0,
                task_key: &entry.1,
                embedding: &entry.2,
                usage_count: 0,
            });
            live.push_back(entry);
            if live.len() > 20 {
                let (id, key, _) = live.pop_front().unwrap();
                set.remove(&id, &key);
            }
            assert!(set.stats().tombstones <= COMPACTION_FLOOR);
        }

        assert_eq!(set.len(), 20);
        let (id, _, v) = &live[10];
        let neighbors = set.refine(v, &[], 10, 32);
        assert_eq!(neighbors.len(), 10);
        assert_eq!(neighbors[0].id, *id);
    }

    #[test]
    fn test_clearing_unflagged_ids_keeps_other_flags() {
        let config = IndexConfig {
            cuckoo_capacity: 64,
            ..small_config()
        };
        let mut set = IndexSet::new(8, &config, 8);
        let flagged: Vec<ExperienceId> = (0..16).map(|_| ExperienceId::new()).collect();
        for id in &flagged {
            set.flag_unhelpful(id);
        }

        for _ in 0..5000 {
            assert!(!set.clear_unhelpful(&ExperienceId::new()));
        }
        assert!(flagged.iter().all(|id| set.is_unhelpful(id)));
        assert_eq!(set.stats().unhelpful_flags, 16);
    }

    #[test]
    fn test_wrong_dimension_is_ignored() {
        let mut set = IndexSet::new(8, &small_config(), 6);
        set.insert(IndexEntry {
            id: ExperienceId::new(),
            task_key: "bad",
            embedding: &[1.0, 2.0],
            usage_count: 0,
        });
        assert!(set.is_empty());
        assert!(set.lsh_candidates(&[1.0]).is_empty());
        assert!(set.refine(&[1.0], &[], 3, 8).is_empty());
    }
}
