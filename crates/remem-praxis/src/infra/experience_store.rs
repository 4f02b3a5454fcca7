//! Experience Storage
//!
//! The authoritative collection of experiences. Indices are derived from it.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use rand::seq::IteratorRandom;
use remem_common::{AgentId, Experience, ExperienceId, RememError, Result, TierId, VisibilityScope};
use remem_darwinian::{CullingPolicy, EvictionCandidate, EvictionQueue, FitnessCalculator};
use tracing::{debug, info, warn};

use crate::domain::indexing::ShardKey;

/// Result of an admitted write
#[derive(Debug, Clone)]
pub struct PutOutcome {
    pub id: ExperienceId,
    /// Records evicted to make room, already gone from the store
    pub evicted: Vec<Experience>,
}

/// Trait for experience storage backends
#[async_trait]
pub trait ExperienceStore: Send + Sync {
    /// Admit a record, evicting to stay within capacity
    async fn put(&self, experience: Experience) -> Result<PutOutcome>;

    /// Get a record by ID
    async fn get(&self, id: &ExperienceId) -> Result<Experience>;

    /// Add `delta` to a record's fitness, clamped to [0, 1]
    async fn adjust_fitness(&self, id: &ExperienceId, delta: f32) -> Result<f32>;

    /// Record one use: bump usage count and last access
    async fn touch(&self, id: &ExperienceId, at: DateTime<Utc>) -> Result<()>;

    /// Widen visibility. Returns the new scope if it changed.
    async fn promote(
        &self,
        id: &ExperienceId,
        scope: VisibilityScope,
        at: DateTime<Utc>,
    ) -> Result<Option<VisibilityScope>>;

    /// Evict until size ≤ capacity
    async fn evict(&self) -> Result<Vec<Experience>>;

    /// Bounded random sample of ids visible through a shard
    async fn sample(&self, shard: &ShardKey, n: usize) -> Vec<ExperienceId>;

    /// Every record visible through a shard
    async fn shard_records(&self, shard: &ShardKey) -> Vec<Experience>;

    /// Every record, oldest first
    async fn all(&self) -> Vec<Experience>;

    /// Current record count
    async fn len(&self) -> usize;

    /// Configured capacity
    fn capacity(&self) -> usize;

    /// Aggregate statistics
    async fn stats(&self) -> StoreStats;
}

/// Statistics about the experience store
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreStats {
    pub total: usize,
    pub capacity: usize,
    pub unique_agents: usize,
    pub unique_tiers: usize,
    pub tier_shared: usize,
    pub breakthroughs: usize,
    pub mean_fitness: f32,
}

/// In-memory storage implementation
///
/// Uses DashMap for concurrent access; capacity checks and shard membership
/// changes run under a short store-wide admission lock. Victims come from a
/// fitness-ordered queue kept in step with every record mutation.
pub struct InMemoryStore {
    /// All experiences by ID
    records: DashMap<ExperienceId, Experience>,

    /// Experience IDs by originating agent
    by_agent: DashMap<AgentId, HashSet<ExperienceId>>,

    /// Tier-visible experience IDs by tier
    by_tier: DashMap<TierId, HashSet<ExperienceId>>,

    /// Collective experience IDs
    collective: DashSet<ExperienceId>,

    /// Serialises capacity checks against inserts, promotions and evictions
    admission: Mutex<()>,

    /// Eviction order. Locked after a record guard, never before one.
    queue: Mutex<EvictionQueue>,

    capacity: usize,
    culling: CullingPolicy,
}

impl InMemoryStore {
    pub fn new(capacity: usize, culling: CullingPolicy) -> Self {
        Self {
            records: DashMap::new(),
            by_agent: DashMap::new(),
            by_tier: DashMap::new(),
            collective: DashSet::new(),
            admission: Mutex::new(()),
            queue: Mutex::new(EvictionQueue::new()),
            capacity: capacity.max(1),
            culling,
        }
    }

    fn link(&self, experience: &Experience) {
        self.by_agent
            .entry(experience.agent_id.clone())
            .or_default()
            .insert(experience.id);
        if experience.visibility.is_tier_visible() {
            self.by_tier
                .entry(experience.tier_id.clone())
                .or_default()
                .insert(experience.id);
        }
        if experience.visibility == VisibilityScope::Collective {
            self.collective.insert(experience.id);
        }
    }

    fn unlink(&self, experience: &Experience) {
        if let Some(mut ids) = self.by_agent.get_mut(&experience.agent_id) {
            ids.remove(&experience.id);
        }
        self.by_agent.remove_if(&experience.agent_id, |_, ids| ids.is_empty());

        if let Some(mut ids) = self.by_tier.get_mut(&experience.tier_id) {
            ids.remove(&experience.id);
        }
        self.by_tier.remove_if(&experience.tier_id, |_, ids| ids.is_empty());

        self.collective.remove(&experience.id);
    }

    fn remove_record(&self, id: &ExperienceId) -> Option<Experience> {
        let (_, experience) = self.records.remove(id)?;
        self.queue.lock().remove(id);
        self.unlink(&experience);
        Some(experience)
    }

    /// Remove `count` victims. Caller holds the admission lock.
    fn cull(&self, count: usize) -> Result<Vec<Experience>> {
        let selected = self.culling.select_victims(&self.queue.lock(), count, Utc::now());
        let victims = selected.map_err(|shortfall| {
            warn!(
                capacity = self.capacity,
                needed = shortfall.needed,
                protected = shortfall.protected,
                "Eviction cannot free enough space"
            );
            RememError::CapacityExhausted {
                capacity: self.capacity,
                protected: shortfall.protected,
            }
        })?;

        Ok(victims
            .iter()
            .filter_map(|id| self.remove_record(id))
            .collect())
    }

    fn shard_ids(&self, shard: &ShardKey) -> Vec<ExperienceId> {
        match shard {
            ShardKey::Agent(agent) => self
                .by_agent
                .get(agent)
                .map(|ids| ids.iter().copied().collect())
                .unwrap_or_default(),
            ShardKey::Tier(tier) => self
                .by_tier
                .get(tier)
                .map(|ids| ids.iter().copied().collect())
                .unwrap_or_default(),
            ShardKey::Collective => self.collective.iter().map(|id| *id).collect(),
        }
    }
}

#[async_trait]
impl ExperienceStore for InMemoryStore {
    async fn put(&self, experience: Experience) -> Result<PutOutcome> {
        let id = experience.id;
        let _admission = self.admission.lock();

        if self.records.contains_key(&id) {
            return Err(RememError::Internal(format!("Duplicate experience id {}", id)));
        }

        let mut evicted = Vec::new();
        let size = self.records.len();
        if size >= self.capacity {
            evicted = self.cull(size + 1 - self.capacity)?;
            info!(count = evicted.len(), "Evicted experiences to admit new record");
        }

        self.link(&experience);
        self.queue.lock().upsert(EvictionCandidate::from(&experience));
        self.records.insert(id, experience);
        debug!(%id, size = self.records.len(), "Experience stored");

        Ok(PutOutcome { id, evicted })
    }

    async fn get(&self, id: &ExperienceId) -> Result<Experience> {
        self.records
            .get(id)
            .map(|e| e.clone())
            .ok_or(RememError::NotFound(*id))
    }

    async fn adjust_fitness(&self, id: &ExperienceId, delta: f32) -> Result<f32> {
        let mut record = self.records.get_mut(id).ok_or(RememError::NotFound(*id))?;
        record.fitness_score = FitnessCalculator::apply(record.fitness_score, delta);
        self.queue.lock().upsert(EvictionCandidate::from(&*record));
        Ok(record.fitness_score)
    }

    async fn touch(&self, id: &ExperienceId, at: DateTime<Utc>) -> Result<()> {
        let mut record = self.records.get_mut(id).ok_or(RememError::NotFound(*id))?;
        record.usage_count = record.usage_count.saturating_add(1);
        if at > record.last_access_at {
            record.last_access_at = at;
        }
        self.queue.lock().upsert(EvictionCandidate::from(&*record));
        Ok(())
    }

    async fn promote(
        &self,
        id: &ExperienceId,
        scope: VisibilityScope,
        at: DateTime<Utc>,
    ) -> Result<Option<VisibilityScope>> {
        // Held across the link so a concurrent cull cannot unlink in between
        let _admission = self.admission.lock();
        let promoted = {
            let mut record = self.records.get_mut(id).ok_or(RememError::NotFound(*id))?;
            let target = record.visibility.widen(scope);
            if target == record.visibility {
                return Ok(None);
            }
            record.visibility = target;
            if target == VisibilityScope::Collective && record.breakthrough_at.is_none() {
                record.breakthrough_at = Some(at);
            }
            self.queue.lock().upsert(EvictionCandidate::from(&*record));
            record.clone()
        };

        self.link(&promoted);
        Ok(Some(promoted.visibility))
    }

    async fn evict(&self) -> Result<Vec<Experience>> {
        let _admission = self.admission.lock();
        let size = self.records.len();
        if size <= self.capacity {
            return Ok(Vec::new());
        }
        let evicted = self.cull(size - self.capacity)?;
        info!(count = evicted.len(), "Evicted experiences over capacity");
        Ok(evicted)
    }

    async fn sample(&self, shard: &ShardKey, n: usize) -> Vec<ExperienceId> {
        let ids = self.shard_ids(shard);
        if ids.len() <= n {
            return ids;
        }
        ids.into_iter().choose_multiple(&mut rand::thread_rng(), n)
    }

    async fn shard_records(&self, shard: &ShardKey) -> Vec<Experience> {
        self.shard_ids(shard)
            .iter()
            .filter_map(|id| self.records.get(id).map(|e| e.clone()))
            .collect()
    }

    async fn all(&self) -> Vec<Experience> {
        let mut all: Vec<Experience> = self.records.iter().map(|e| e.clone()).collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        all
    }

    async fn len(&self) -> usize {
        self.records.len()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    async fn stats(&self) -> StoreStats {
        let mut total = 0usize;
        let mut fitness_sum = 0.0f64;
        let mut tier_shared = 0usize;
        let mut breakthroughs = 0usize;

        for record in self.records.iter() {
            total += 1;
            fitness_sum += record.fitness_score as f64;
            if record.visibility == VisibilityScope::TierShared {
                tier_shared += 1;
            }
            if record.is_breakthrough() {
                breakthroughs += 1;
            }
        }

        StoreStats {
            total,
            capacity: self.capacity,
            unique_agents: self.by_agent.len(),
            unique_tiers: self
                .records
                .iter()
                .map(|r| r.tier_id.clone())
                .collect::<HashSet<_>>()
                .len(),
            tier_shared,
            breakthroughs,
            mean_fitness: if total > 0 {
                (fitness_sum / total as f64) as f32
            } else {
                0.0
            },
        }
    }
}
