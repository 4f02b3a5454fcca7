//! Sharded Indexing
//!
//! One [`IndexSet`] per agent, per tier and one for the collective, each
//! behind its own lock. Writers for one agent never block readers of an
//! unrelated agent or tier.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use remem_common::{AgentId, Experience, ExperienceId, TierId, VisibilityScope};
use remem_index::{IndexConfig, IndexEntry, IndexSet, IndexStats};
use tracing::{debug, info};

/// Which index set a record lives in
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ShardKey {
    Agent(AgentId),
    Tier(TierId),
    Collective,
}

impl ShardKey {
    /// Every shard a record belongs to given its current visibility
    pub fn holding(experience: &Experience) -> Vec<ShardKey> {
        let mut keys = vec![ShardKey::Agent(experience.agent_id.clone())];
        if experience.visibility.is_tier_visible() {
            keys.push(ShardKey::Tier(experience.tier_id.clone()));
        }
        if experience.visibility == VisibilityScope::Collective {
            keys.push(ShardKey::Collective);
        }
        keys
    }

    /// Whether a record is visible through this shard
    pub fn admits(&self, experience: &Experience) -> bool {
        match self {
            ShardKey::Agent(agent) => experience.agent_id == *agent,
            ShardKey::Tier(tier) => {
                experience.tier_id == *tier && experience.visibility.is_tier_visible()
            }
            ShardKey::Collective => experience.visibility == VisibilityScope::Collective,
        }
    }

    /// Stable per-shard seed so rebuilt shards hash identically
    fn seed(&self) -> u64 {
        let digest = blake3::hash(self.to_string().as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest.as_bytes()[..8]);
        u64::from_le_bytes(bytes)
    }
}

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardKey::Agent(agent) => write!(f, "agent:{}", agent),
            ShardKey::Tier(tier) => write!(f, "tier:{}", tier),
            ShardKey::Collective => write!(f, "collective"),
        }
    }
}

fn index_entry<'a>(experience: &'a Experience, task_key: &'a str) -> IndexEntry<'a> {
    IndexEntry {
        id: experience.id,
        task_key,
        embedding: &experience.embedding,
        usage_count: experience.usage_count,
    }
}

pub type SharedIndexSet = Arc<RwLock<IndexSet>>;

/// Index sets keyed by shard
pub struct ShardedIndex {
    dimension: usize,
    config: IndexConfig,
    shards: DashMap<ShardKey, SharedIndexSet>,
}

impl ShardedIndex {
    pub fn new(dimension: usize, config: IndexConfig) -> Self {
        Self {
            dimension,
            config,
            shards: DashMap::new(),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Existing shard, if any. The map guard is released before returning.
    pub fn shard(&self, key: &ShardKey) -> Option<SharedIndexSet> {
        self.shards.get(key).map(|s| Arc::clone(s.value()))
    }

    fn shard_or_create(&self, key: &ShardKey) -> SharedIndexSet {
        if let Some(shard) = self.shard(key) {
            return shard;
        }
        let shard = self
            .shards
            .entry(key.clone())
            .or_insert_with(|| {
                debug!(shard = %key, "Creating index shard");
                Arc::new(RwLock::new(IndexSet::new(self.dimension, &self.config, key.seed())))
            });
        Arc::clone(shard.value())
    }

    /// Insert a record into one shard
    pub fn insert_into(&self, key: &ShardKey, experience: &Experience) {
        let task_key = experience.task_key();
        let shard = self.shard_or_create(key);
        shard.write().insert(index_entry(experience, &task_key));
    }

    /// Insert a record into every shard its visibility places it in
    pub fn index(&self, experience: &Experience) -> Vec<ShardKey> {
        let keys = ShardKey::holding(experience);
        for key in &keys {
            self.insert_into(key, experience);
        }
        keys
    }

    /// Remove a record from every shard that may hold it
    pub fn remove(&self, experience: &Experience) {
        let task_key = experience.task_key();
        for key in ShardKey::holding(experience) {
            if let Some(shard) = self.shard(&key) {
                shard.write().remove(&experience.id, &task_key);
            }
        }
    }

    /// Count a retrieval of a record in every shard holding it
    pub fn record_retrieval(&self, experience: &Experience) {
        for key in ShardKey::holding(experience) {
            if let Some(shard) = self.shard(&key) {
                shard.write().record_retrieval(&experience.id);
            }
        }
    }

    /// Set or clear the unhelpful flag of a record in every shard holding it
    pub fn set_unhelpful(&self, experience: &Experience, unhelpful: bool) {
        for key in ShardKey::holding(experience) {
            if let Some(shard) = self.shard(&key) {
                let mut guard = shard.write();
                if unhelpful {
                    guard.flag_unhelpful(&experience.id);
                } else {
                    guard.clear_unhelpful(&experience.id);
                }
            }
        }
    }

    pub fn mark_dirty(&self, key: &ShardKey) {
        if let Some(shard) = self.shard(key) {
            shard.write().mark_dirty();
        }
    }

    pub fn is_dirty(&self, key: &ShardKey) -> bool {
        self.shard(key).map(|s| s.read().is_dirty()).unwrap_or(false)
    }

    /// Shards flagged for repair
    pub fn dirty_shards(&self) -> Vec<ShardKey> {
        let mut keys: Vec<ShardKey> = self
            .shards
            .iter()
            .filter(|s| s.value().read().is_dirty())
            .map(|s| s.key().clone())
            .collect();
        keys.sort();
        keys
    }

    /// Replace one shard's contents with `records`
    pub fn rebuild_shard(&self, key: &ShardKey, records: &[Experience]) {
        let keys: Vec<String> = records.iter().map(Experience::task_key).collect();
        let shard = self.shard_or_create(key);
        shard.write().rebuild(
            records
                .iter()
                .zip(&keys)
                .filter(|(e, _)| key.admits(e))
                .map(|(e, k)| index_entry(e, k)),
        );
        info!(shard = %key, records = records.len(), "Index shard rebuilt");
    }

    /// Drop every shard and re-index `records` from scratch
    pub fn rebuild_all(&self, records: &[Experience]) {
        self.shards.clear();
        for experience in records {
            self.index(experience);
        }
        info!(records = records.len(), shards = self.shards.len(), "All index shards rebuilt");
    }

    /// Whether a shard currently indexes an id
    pub fn contains(&self, key: &ShardKey, id: &ExperienceId) -> bool {
        self.shard(key).map(|s| s.read().contains(id)).unwrap_or(false)
    }

    pub fn stats(&self) -> Vec<(ShardKey, IndexStats)> {
        let mut stats: Vec<_> = self
            .shards
            .iter()
            .map(|s| (s.key().clone(), s.value().read().stats()))
            .collect();
        stats.sort_by(|a, b| a.0.cmp(&b.0));
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use remem_common::TaskInput;

    fn experience(agent: &str, tier: &str, task: &str, visibility: VisibilityScope) -> Experience {
        let mut embedding = vec![0.0; 8];
        embedding[task.len() % 8] = 1.0;
        let mut e = Experience::new(
            agent.into(),
            tier.into(),
            TaskInput::new(task),
            "out",
            "strategy",
            embedding,
        );
        e.visibility = visibility;
        e
    }

    #[test]
    fn test_holding_follows_visibility() {
        let local = experience("a", "t", "x", VisibilityScope::AgentLocal);
        assert_eq!(ShardKey::holding(&local), vec![ShardKey::Agent("a".into())]);

        let collective = experience("a", "t", "x", VisibilityScope::Collective);
        assert_eq!(
            ShardKey::holding(&collective),
            vec![
                ShardKey::Agent("a".into()),
                ShardKey::Tier("t".into()),
                ShardKey::Collective
            ]
        );
    }

    #[test]
    fn test_index_and_remove_across_shards() {
        let index = ShardedIndex::new(8, IndexConfig::default());
        let e = experience("a", "t", "Solve It", VisibilityScope::TierShared);
        index.index(&e);

        let tier = ShardKey::Tier("t".into());
        assert!(index.contains(&ShardKey::Agent("a".into()), &e.id));
        assert!(index.contains(&tier, &e.id));
        assert!(!index.contains(&ShardKey::Collective, &e.id));
        let exact = index.shard(&tier).and_then(|s| s.read().exact_match("solve it"));
        assert_eq!(exact, Some(e.id));

        index.remove(&e);
        assert!(!index.contains(&tier, &e.id));
    }

    #[test]
    fn test_dirty_shard_rebuild() {
        let index = ShardedIndex::new(8, IndexConfig::default());
        let agent = ShardKey::Agent("a".into());
        let records: Vec<_> = (0..5)
            .map(|i| experience("a", "t", &format!("task {}", i), VisibilityScope::AgentLocal))
            .collect();
        for e in &records {
            index.index(e);
        }

        index.mark_dirty(&agent);
        assert_eq!(index.dirty_shards(), vec![agent.clone()]);

        index.rebuild_shard(&agent, &records[1..]);
        assert!(!index.is_dirty(&agent));
        assert!(!index.contains(&agent, &records[0].id));
        assert!(index.contains(&agent, &records[1].id));
    }

    #[test]
    fn test_shard_seed_is_stable() {
        let key = ShardKey::Tier("gold".into());
        assert_eq!(key.seed(), ShardKey::Tier("gold".into()).seed());
        assert_ne!(key.seed(), ShardKey::Collective.seed());
    }
}
