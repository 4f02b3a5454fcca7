//! Navigable proximity graph (HNSW)
//!
//! Layered small-world graph: every node lives on layer 0 and on each higher
//! layer with geometrically decreasing probability. Search descends greedily
//! from the top entry point and finishes with an `ef`-bounded beam on layer 0,
//! which gives O(log n) expected hops.
//!
//! Removal is a tombstone: the node keeps routing traffic but never appears in
//! results. [`Hnsw::compact`] re-links the live nodes and drops every
//! tombstone.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use ordered_float::OrderedFloat;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use remem_common::ExperienceId;

use crate::distance::l2;

#[derive(Debug, Clone)]
struct Node {
    id: ExperienceId,
    vector: Vec<f32>,
    /// `neighbors[layer]`
    neighbors: Vec<Vec<usize>>,
    deleted: bool,
}

impl Node {
    fn level(&self) -> usize {
        self.neighbors.len() - 1
    }
}

/// Graph construction parameters
#[derive(Debug, Clone)]
pub struct HnswParams {
    /// Max neighbours per node on layers > 0 (layer 0 allows `2 * m`)
    pub m: usize,
    /// Beam width while inserting
    pub ef_construction: usize,
    /// Number of fixed global entry points kept for multi-seed search
    pub global_entries: usize,
}

impl Default for HnswParams {
    fn default() -> Self {
        Self {
            m: 12,
            ef_construction: 64,
            global_entries: 4,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Hnsw {
    params: HnswParams,
    nodes: Vec<Node>,
    slots: HashMap<ExperienceId, usize>,
    entry: Option<usize>,
    /// Highest-level nodes, used as extra search seeds
    globals: Vec<usize>,
    level_mult: f64,
    live: usize,
    rng: StdRng,
}

type Scored = (OrderedFloat<f32>, usize);

impl Hnsw {
    pub fn new(params: HnswParams, seed: u64) -> Self {
        let m = params.m.max(2);
        Self {
            params: HnswParams { m, ..params },
            nodes: Vec::new(),
            slots: HashMap::new(),
            entry: None,
            globals: Vec::new(),
            level_mult: 1.0 / (m as f64).ln(),
            live: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn max_neighbors(&self, layer: usize) -> usize {
        if layer == 0 {
            self.params.m * 2
        } else {
            self.params.m
        }
    }

    fn random_level(&mut self) -> usize {
        let u: f64 = self.rng.gen_range(f64::EPSILON..1.0);
        ((-u.ln()) * self.level_mult).floor() as usize
    }

    /// Greedy best-first search on one layer.
    ///
    /// Returns up to `ef` `(distance, slot)` pairs, closest first. Tombstoned
    /// nodes are traversed and returned; callers filter them.
    fn search_layer<F>(&self, seeds: &[usize], ef: usize, layer: usize, dist: &F) -> Vec<Scored>
    where
        F: Fn(&Node) -> f32,
    {
        let mut visited: HashSet<usize> = HashSet::new();
        let mut candidates: BinaryHeap<Reverse<Scored>> = BinaryHeap::new();
        let mut results: BinaryHeap<Scored> = BinaryHeap::new();

        for &s in seeds {
            if s < self.nodes.len() && self.nodes[s].level() >= layer && visited.insert(s) {
                let d = OrderedFloat(dist(&self.nodes[s]));
                candidates.push(Reverse((d, s)));
                results.push((d, s));
                if results.len() > ef {
                    results.pop();
                }
            }
        }

        while let Some(Reverse((d, slot))) = candidates.pop() {
            let worst = results.peek().map(|r| r.0).unwrap_or(OrderedFloat(f32::MAX));
            if d > worst && results.len() >= ef {
                break;
            }

            for &n in &self.nodes[slot].neighbors[layer] {
                if !visited.insert(n) {
                    continue;
                }
                let dn = OrderedFloat(dist(&self.nodes[n]));
                let worst = results.peek().map(|r| r.0).unwrap_or(OrderedFloat(f32::MAX));
                if results.len() < ef || dn < worst {
                    candidates.push(Reverse((dn, n)));
                    results.push((dn, n));
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        results.into_sorted_vec()
    }

    /// Descend from the top entry point to `target_layer + 1` with beam 1
    fn descend<F>(&self, dist: &F, target_layer: usize) -> Option<usize>
    where
        F: Fn(&Node) -> f32,
    {
        let mut current = self.entry?;
        let top = self.nodes[current].level();
        for layer in (target_layer + 1..=top).rev() {
            if let Some((_, best)) = self.search_layer(&[current], 1, layer, dist).first() {
                current = *best;
            }
        }
        Some(current)
    }

    /// Keep the `max` closest neighbours of `slot` on `layer`
    fn prune(&mut self, slot: usize, layer: usize) {
        let max = self.max_neighbors(layer);
        if self.nodes[slot].neighbors[layer].len() <= max {
            return;
        }
        let base = self.nodes[slot].vector.clone();
        let mut scored: Vec<Scored> = self.nodes[slot].neighbors[layer]
            .iter()
            .map(|&n| (OrderedFloat(l2(&base, &self.nodes[n].vector)), n))
            .collect();
        scored.sort();
        scored.truncate(max);
        self.nodes[slot].neighbors[layer] = scored.into_iter().map(|(_, n)| n).collect();
    }

    fn update_globals(&mut self, slot: usize) {
        let cap = self.params.global_entries;
        if cap == 0 {
            return;
        }
        if self.globals.len() < cap {
            self.globals.push(slot);
            return;
        }
        let level = self.nodes[slot].level();
        if let Some((pos, _)) = self
            .globals
            .iter()
            .enumerate()
            .map(|(i, &g)| (i, self.nodes[g].level()))
            .filter(|(_, l)| *l < level)
            .min_by_key(|(_, l)| *l)
        {
            self.globals[pos] = slot;
        }
    }

    /// Insert a vector. Re-inserting a live id is a no-op.
    pub fn insert(&mut self, id: ExperienceId, vector: Vec<f32>) {
        if let Some(&slot) = self.slots.get(&id) {
            if self.nodes[slot].deleted {
                self.nodes[slot].deleted = false;
                self.live += 1;
            }
            return;
        }

        let level = self.random_level();
        let slot = self.nodes.len();
        self.nodes.push(Node {
            id,
            vector,
            neighbors: vec![Vec::new(); level + 1],
            deleted: false,
        });
        self.slots.insert(id, slot);
        self.live += 1;

        let Some(entry) = self.entry else {
            self.entry = Some(slot);
            self.update_globals(slot);
            return;
        };

        let query = self.nodes[slot].vector.clone();
        let dist = |n: &Node| l2(&query, &n.vector);

        let top = self.nodes[entry].level();
        let mut seeds = vec![self.descend(&dist, level).unwrap_or(entry)];

        for layer in (0..=level.min(top)).rev() {
            let found = self.search_layer(&seeds, self.params.ef_construction, layer, &dist);
            let chosen: Vec<usize> = found
                .iter()
                .map(|(_, n)| *n)
                .filter(|n| *n != slot)
                .take(self.params.m)
                .collect();

            for &n in &chosen {
                self.nodes[slot].neighbors[layer].push(n);
                self.nodes[n].neighbors[layer].push(slot);
                self.prune(n, layer);
            }

            seeds = found.into_iter().map(|(_, n)| n).collect();
        }

        if level > top {
            self.entry = Some(slot);
        }
        self.update_globals(slot);
    }

    /// Tombstone a node. Returns whether a live node was removed.
    pub fn remove(&mut self, id: &ExperienceId) -> bool {
        match self.slots.get(id) {
            Some(&slot) if !self.nodes[slot].deleted => {
                self.nodes[slot].deleted = true;
                self.live -= 1;
                true
            }
            _ => false,
        }
    }

    /// Rebuild the graph from its live nodes, dropping every tombstone
    pub fn compact(&mut self) {
        let nodes = std::mem::take(&mut self.nodes);
        self.slots.clear();
        self.globals.clear();
        self.entry = None;
        self.live = 0;
        for node in nodes.into_iter().filter(|n| !n.deleted) {
            self.insert(node.id, node.vector);
        }
    }

    /// Top-`k` live nodes by exact Euclidean distance
    pub fn search(&self, query: &[f32], k: usize, ef: usize) -> Vec<(ExperienceId, f32)> {
        self.search_with(&[], k, ef, |_, v| l2(query, v))
    }

    /// Top-`k` live nodes under a caller-supplied distance.
    ///
    /// The layer-0 beam is seeded with the descended entry point, the fixed
    /// global entry points and every id in `seeds` that is in the graph.
    pub fn search_with<F>(
        &self,
        seeds: &[ExperienceId],
        k: usize,
        ef: usize,
        distance: F,
    ) -> Vec<(ExperienceId, f32)>
    where
        F: Fn(ExperienceId, &[f32]) -> f32,
    {
        if self.entry.is_none() || k == 0 {
            return Vec::new();
        }
        let dist = |n: &Node| distance(n.id, &n.vector);

        let mut start: Vec<usize> = Vec::with_capacity(seeds.len() + self.globals.len() + 1);
        if let Some(e) = self.descend(&dist, 0) {
            start.push(e);
        }
        start.extend(self.globals.iter().copied());
        start.extend(seeds.iter().filter_map(|id| self.slots.get(id).copied()));

        let ef = ef.max(k);
        self.search_layer(&start, ef, 0, &dist)
            .into_iter()
            .filter(|(_, slot)| !self.nodes[*slot].deleted)
            .take(k)
            .map(|(d, slot)| (self.nodes[slot].id, d.into_inner()))
            .collect()
    }

    /// Stored vector for a live id
    pub fn vector(&self, id: &ExperienceId) -> Option<&[f32]> {
        self.slots
            .get(id)
            .map(|&s| &self.nodes[s])
            .filter(|n| !n.deleted)
            .map(|n| n.vector.as_slice())
    }

    /// Live `(id, vector)` pairs
    pub fn live_vectors(&self) -> impl Iterator<Item = (ExperienceId, &[f32])> {
        self.nodes
            .iter()
            .filter(|n| !n.deleted)
            .map(|n| (n.id, n.vector.as_slice()))
    }

    pub fn contains(&self, id: &ExperienceId) -> bool {
        self.vector(id).is_some()
    }

    /// Live node count
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Tombstoned node count
    pub fn tombstones(&self) -> usize {
        self.nodes.len() - self.live
    }

    /// Highest layer in the graph
    pub fn max_level(&self) -> usize {
        self.entry.map(|e| self.nodes[e].level()).unwrap_or(0)
    }
}
