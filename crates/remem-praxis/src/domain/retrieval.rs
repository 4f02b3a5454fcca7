//! Multi-Index Retrieval
//!
//! Sub-linear `Query` over the sharded index sets:
//!
//! 1. Exact-duplicate fast path (Bloom filter + task key map)
//! 2. LSH candidates; below `min_candidates` a bounded store sample is added
//! 3. Graph refinement seeded with the candidates, PQ distances, exact re-score
//! 4. Weighted score: distance, popularity, fitness, recency, unhelpful penalty
//! 5. Agent-local, tier-shared and collective lists ranked independently
//!
//! An exact-duplicate hit from any visible scope leads the whole result: it
//! heads `agent_local` and keeps its native scope in [`ScoredExperience::scope`].
//!
//! Retrieval is read-only and never fails on index trouble: missing records
//! are dropped, logged, and their shard is flagged for repair.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use remem_common::{
    normalize_task, AgentId, Experience, ExperienceId, RememError, Result, TierId,
    ValidationError, VisibilityScope,
};
use remem_index::distance::l2;
use tracing::{debug, instrument, warn};

use super::indexing::{ShardKey, ShardedIndex};
use crate::config::{RetrievalSettings, ScoreWeights};
use crate::infra::experience_store::ExperienceStore;
use crate::infra::telemetry::{IndexOp, RememMetrics};

/// Configuration for the retrieval pipeline
#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    /// Agent-local results (K₁)
    pub k_agent: usize,
    /// Tier-shared results (K₂)
    pub k_tier: usize,
    /// Collective results (K₃)
    pub k_collective: usize,
    /// LSH candidates below which the store is sampled
    pub min_candidates: usize,
    /// Linear fallback sample size
    pub fallback_sample: usize,
    /// Graph search beam width
    pub ef_search: usize,
    pub weights: ScoreWeights,
    pub unhelpful_penalty: f32,
    pub decay_half_life_days: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self::from(&RetrievalSettings::default())
    }
}

impl From<&RetrievalSettings> for RetrievalConfig {
    fn from(settings: &RetrievalSettings) -> Self {
        Self {
            k_agent: settings.k_agent,
            k_tier: settings.k_tier,
            k_collective: settings.k_collective,
            min_candidates: settings.min_candidates,
            fallback_sample: settings.fallback_sample,
            ef_search: settings.ef_search.max(1),
            weights: settings.weights,
            unhelpful_penalty: settings.unhelpful_penalty,
            decay_half_life_days: settings.decay_half_life_days,
        }
    }
}

/// Who is asking, and optional narrowing
#[derive(Debug, Clone, PartialEq)]
pub struct QueryFilters {
    pub agent_id: AgentId,
    pub tier_id: TierId,
    /// Overrides (K₁, K₂, K₃)
    pub limits: Option<(usize, usize, usize)>,
    /// Drop results below this fitness (exact duplicates are kept)
    pub min_fitness: Option<f32>,
}

impl QueryFilters {
    pub fn new(agent_id: impl Into<AgentId>, tier_id: impl Into<TierId>) -> Self {
        Self {
            agent_id: agent_id.into(),
            tier_id: tier_id.into(),
            limits: None,
            min_fitness: None,
        }
    }

    pub fn with_limits(mut self, k_agent: usize, k_tier: usize, k_collective: usize) -> Self {
        self.limits = Some((k_agent, k_tier, k_collective));
        self
    }

    pub fn with_min_fitness(mut self, min_fitness: f32) -> Self {
        self.min_fitness = Some(min_fitness);
        self
    }
}

/// A retrieved experience with its score breakdown
#[derive(Debug, Clone)]
pub struct ScoredExperience {
    pub experience: Experience,
    /// List the result was returned in
    pub scope: VisibilityScope,
    pub score: f32,
    /// Exact Euclidean distance to the query embedding
    pub distance: f32,
    /// Approximate retrieval count
    pub popularity: u32,
    /// Flagged as recently unhelpful
    pub unhelpful: bool,
    /// Found through the exact-duplicate fast path
    pub exact_match: bool,
}

/// Results per scope, each ranked independently.
///
/// An exact-duplicate hit, whatever its scope, is `agent_local[0]`.
#[derive(Debug, Clone, Default)]
pub struct RankedResult {
    pub agent_local: Vec<ScoredExperience>,
    pub tier_shared: Vec<ScoredExperience>,
    pub collective: Vec<ScoredExperience>,
}

impl RankedResult {
    /// All results in priority order: agent-local, tier-shared, collective
    pub fn iter(&self) -> impl Iterator<Item = &ScoredExperience> {
        self.agent_local
            .iter()
            .chain(self.tier_shared.iter())
            .chain(self.collective.iter())
    }

    pub fn ids(&self) -> Vec<ExperienceId> {
        self.iter().map(|s| s.experience.id).collect()
    }

    pub fn len(&self) -> usize {
        self.agent_local.len() + self.tier_shared.len() + self.collective.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-candidate facts gathered under the shard read lock
#[derive(Debug, Clone, Copy)]
struct Hit {
    distance: Option<f32>,
    popularity: u32,
    unhelpful: bool,
    exact: bool,
}

fn scope_of(key: &ShardKey) -> VisibilityScope {
    match key {
        ShardKey::Agent(_) => VisibilityScope::AgentLocal,
        ShardKey::Tier(_) => VisibilityScope::TierShared,
        ShardKey::Collective => VisibilityScope::Collective,
    }
}

/// Multi-index retriever
pub struct MultiIndexRetriever {
    store: Arc<dyn ExperienceStore>,
    index: Arc<ShardedIndex>,
    config: RetrievalConfig,
    metrics: Arc<RememMetrics>,
}

impl MultiIndexRetriever {
    pub fn new(
        store: Arc<dyn ExperienceStore>,
        index: Arc<ShardedIndex>,
        config: RetrievalConfig,
        metrics: Arc<RememMetrics>,
    ) -> Self {
        Self {
            store,
            index,
            config,
            metrics,
        }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Rank experiences for a task.
    ///
    /// Only malformed embeddings are errors; everything else degrades to
    /// fewer results.
    #[instrument(skip_all, fields(agent = %filters.agent_id, tier = %filters.tier_id))]
    pub async fn query(
        &self,
        embedding: &[f32],
        task_text: &str,
        filters: &QueryFilters,
    ) -> Result<RankedResult> {
        if embedding.len() != self.index.dimension() {
            return Err(ValidationError::DimensionMismatch {
                expected: self.index.dimension(),
                actual: embedding.len(),
            }
            .into());
        }
        if embedding.iter().any(|x| !x.is_finite()) {
            return Err(ValidationError::NonFiniteEmbedding.into());
        }

        let start = Instant::now();
        let now = Utc::now();
        let task_key = normalize_task(task_text);
        let (k_agent, k_tier, k_collective) = filters.limits.unwrap_or((
            self.config.k_agent,
            self.config.k_tier,
            self.config.k_collective,
        ));

        // Wider scopes over-fetch so de-duplication cannot starve them
        let (mut agent, mut tier, mut collective) = futures::join!(
            self.query_shard(
                ShardKey::Agent(filters.agent_id.clone()),
                embedding,
                &task_key,
                k_agent,
                filters,
                now
            ),
            self.query_shard(
                ShardKey::Tier(filters.tier_id.clone()),
                embedding,
                &task_key,
                if k_tier == 0 { 0 } else { k_tier + k_agent },
                filters,
                now
            ),
            self.query_shard(
                ShardKey::Collective,
                embedding,
                &task_key,
                if k_collective == 0 { 0 } else { k_collective + k_tier + k_agent },
                filters,
                now
            ),
        );

        // Narrowest scope wins when several hold the same task
        let exact = take_exact(&mut agent)
            .or_else(|| take_exact(&mut tier))
            .or_else(|| take_exact(&mut collective));

        let mut seen = HashSet::new();
        let mut agent_local = Vec::with_capacity(k_agent.max(1));
        let mut agent_slots = k_agent;
        if let Some(hit) = exact {
            seen.insert(hit.experience.id);
            agent_local.push(hit);
            agent_slots = agent_slots.saturating_sub(1);
        }
        agent_local.extend(take_unseen(agent, agent_slots, &mut seen));

        let result = RankedResult {
            agent_local,
            tier_shared: take_unseen(tier, k_tier, &mut seen),
            collective: take_unseen(collective, k_collective, &mut seen),
        };

        self.metrics.observe(IndexOp::Query, start.elapsed());
        debug!(
            agent_local = result.agent_local.len(),
            tier_shared = result.tier_shared.len(),
            collective = result.collective.len(),
            "Query complete"
        );
        Ok(result)
    }

    async fn query_shard(
        &self,
        key: ShardKey,
        query: &[f32],
        task_key: &str,
        k: usize,
        filters: &QueryFilters,
        now: DateTime<Utc>,
    ) -> Vec<ScoredExperience> {
        if k == 0 {
            return Vec::new();
        }

        let shard = self.index.shard(&key);

        let (exact, seeds) = match &shard {
            Some(set) => {
                let set = set.read();
                (set.exact_match(task_key), set.lsh_candidates(query))
            }
            None => (None, Vec::new()),
        };

        let sampled = if seeds.len() < self.config.min_candidates {
            self.store.sample(&key, self.config.fallback_sample).await
        } else {
            Vec::new()
        };
        self.metrics.record_candidates(seeds.len() + sampled.len());

        let mut hits: HashMap<ExperienceId, Hit> = HashMap::new();
        match &shard {
            Some(set) => {
                let set = set.read();
                let all_seeds: Vec<ExperienceId> =
                    seeds.iter().chain(sampled.iter()).copied().collect();
                let hit_for = |id: &ExperienceId, distance: Option<f32>| Hit {
                    distance,
                    popularity: set.popularity(id),
                    unhelpful: set.is_unhelpful(id),
                    exact: false,
                };

                for n in set.refine(query, &all_seeds, k.saturating_mul(2), self.config.ef_search) {
                    hits.insert(n.id, hit_for(&n.id, Some(n.distance)));
                }
                for id in &sampled {
                    hits.entry(*id)
                        .or_insert_with(|| hit_for(id, set.distance_to(query, id)));
                }
                if let Some(id) = exact {
                    hits.entry(id)
                        .or_insert_with(|| hit_for(&id, set.distance_to(query, &id)))
                        .exact = true;
                }
            }
            None => {
                for id in sampled {
                    hits.insert(
                        id,
                        Hit {
                            distance: None,
                            popularity: 0,
                            unhelpful: false,
                            exact: false,
                        },
                    );
                }
            }
        }

        let mut scored = Vec::with_capacity(hits.len());
        for (id, hit) in hits {
            let experience = match self.store.get(&id).await {
                Ok(e) => e,
                Err(RememError::NotFound(_)) => {
                    warn!(%id, shard = %key, "Index entry points at missing experience");
                    self.metrics.record_inconsistency();
                    self.index.mark_dirty(&key);
                    continue;
                }
                Err(e) => {
                    warn!(%id, error = %e, "Failed to resolve candidate");
                    continue;
                }
            };

            if !key.admits(&experience) {
                continue;
            }
            if let Some(min) = filters.min_fitness {
                if experience.fitness_score < min && !hit.exact {
                    continue;
                }
            }

            let distance = hit.distance.unwrap_or_else(|| l2(query, &experience.embedding));
            let score = self.score(&experience, distance, hit, now);
            scored.push(ScoredExperience {
                experience,
                scope: scope_of(&key),
                score,
                distance,
                popularity: hit.popularity,
                unhelpful: hit.unhelpful,
                exact_match: hit.exact,
            });
        }

        scored.sort_by(|a, b| {
            b.exact_match
                .cmp(&a.exact_match)
                .then(b.score.total_cmp(&a.score))
                .then(a.experience.id.cmp(&b.experience.id))
        });
        scored
    }

    /// Weighted score; higher is better
    fn score(&self, experience: &Experience, distance: f32, hit: Hit, now: DateTime<Utc>) -> f32 {
        let w = &self.config.weights;
        let decay = experience.time_decay_factor(self.config.decay_half_life_days, now);

        let mut score = -w.distance * distance
            + w.popularity * (hit.popularity as f32).ln_1p()
            + w.fitness * experience.fitness_score
            + w.recency * decay;
        if hit.unhelpful {
            score -= self.config.unhelpful_penalty;
        }
        score
    }
}

/// Pull the exact-duplicate hit off the head of a ranked list
fn take_exact(ranked: &mut Vec<ScoredExperience>) -> Option<ScoredExperience> {
    match ranked.first() {
        Some(first) if first.exact_match => Some(ranked.remove(0)),
        _ => None,
    }
}

fn take_unseen(
    ranked: Vec<ScoredExperience>,
    k: usize,
    seen: &mut HashSet<ExperienceId>,
) -> Vec<ScoredExperience> {
    let mut out = Vec::with_capacity(k);
    for candidate in ranked {
        if out.len() == k {
            break;
        }
        if seen.insert(candidate.experience.id) {
            out.push(candidate);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::experience_store::InMemoryStore;
    use chrono::Duration;
    use remem_common::TaskInput;
    use remem_darwinian::CullingPolicy;
    use remem_index::IndexConfig;

    struct Fixture {
        store: Arc<InMemoryStore>,
        index: Arc<ShardedIndex>,
        retriever: MultiIndexRetriever,
        metrics: Arc<RememMetrics>,
    }

    fn fixture(dim: usize) -> Fixture {
        let store = Arc::new(InMemoryStore::new(10_000, CullingPolicy::new(Duration::days(7))));
        let index = Arc::new(ShardedIndex::new(dim, IndexConfig::default()));
        let metrics = Arc::new(RememMetrics::new().unwrap());
        let retriever = MultiIndexRetriever::new(
            store.clone(),
            index.clone(),
            RetrievalConfig::default(),
            metrics.clone(),
        );
        Fixture {
            store,
            index,
            retriever,
            metrics,
        }
    }

    fn unit(dim: usize, hot: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[hot % dim] = 1.0;
        v
    }

    async fn add(
        f: &Fixture,
        agent: &str,
        tier: &str,
        task: &str,
        embedding: Vec<f32>,
        vis: VisibilityScope,
    ) -> Experience {
        let mut e = Experience::new(
            agent.into(),
            tier.into(),
            TaskInput::new(task),
            "out",
            "s",
            embedding,
        );
        e.visibility = vis;
        f.store.put(e.clone()).await.unwrap();
        f.index.index(&e);
        e
    }

    #[tokio::test]
    async fn test_empty_store_returns_nothing() {
        let f = fixture(8);
        let result = f
            .retriever
            .query(&unit(8, 0), "anything", &QueryFilters::new("a", "t"))
            .await
            .unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn test_rejects_wrong_dimension() {
        let f = fixture(8);
        let err = f
            .retriever
            .query(&[1.0, 0.0], "x", &QueryFilters::new("a", "t"))
            .await
            .unwrap_err();
        assert!(matches!(err, RememError::Validation(_)));
    }

    #[tokio::test]
    async fn test_exact_duplicate_ranked_first() {
        let f = fixture(8);
        for i in 0..6 {
            let task = format!("other task {}", i);
            add(&f, "a", "t", &task, unit(8, 1), VisibilityScope::AgentLocal).await;
        }
        // Far away in embedding space, but an exact task match
        let target =
            add(&f, "a", "t", "Fix The Build", unit(8, 5), VisibilityScope::AgentLocal).await;

        let result = f
            .retriever
            .query(&unit(8, 1), "fix  the build", &QueryFilters::new("a", "t"))
            .await
            .unwrap();
        assert_eq!(result.agent_local[0].experience.id, target.id);
        assert!(result.agent_local[0].exact_match);
    }

    #[tokio::test]
    async fn test_exact_duplicate_from_tier_peer_leads_result() {
        let f = fixture(8);
        for i in 0..5 {
            let task = format!("own task {}", i);
            add(&f, "a", "t", &task, unit(8, 1), VisibilityScope::AgentLocal).await;
        }
        let peer = add(
            &f,
            "b",
            "t",
            "rotate the signing keys",
            unit(8, 6),
            VisibilityScope::TierShared,
        )
        .await;

        let result = f
            .retriever
            .query(&unit(8, 1), "Rotate the signing keys", &QueryFilters::new("a", "t"))
            .await
            .unwrap();

        let first = result.iter().next().unwrap();
        assert_eq!(first.experience.id, peer.id);
        assert!(first.exact_match);
        assert_eq!(first.scope, VisibilityScope::TierShared);
        assert!(result.tier_shared.iter().all(|s| s.experience.id != peer.id));
        assert_eq!(result.agent_local.len(), 5);
        let ids = result.ids();
        let unique: HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), ids.len());
    }

    #[tokio::test]
    async fn test_scopes_are_separated_and_deduplicated() {
        let f = fixture(8);
        let own = add(&f, "a", "t", "own", unit(8, 0), VisibilityScope::Collective).await;
        let peer = add(&f, "b", "t", "peer", unit(8, 0), VisibilityScope::TierShared).await;
        let foreign =
            add(&f, "z", "other", "foreign", unit(8, 0), VisibilityScope::Collective).await;
        let hidden = add(&f, "c", "t", "hidden", unit(8, 0), VisibilityScope::AgentLocal).await;

        let result = f
            .retriever
            .query(&unit(8, 0), "q", &QueryFilters::new("a", "t"))
            .await
            .unwrap();

        let ids = result.ids();
        assert_eq!(result.agent_local.len(), 1);
        assert_eq!(result.agent_local[0].experience.id, own.id);
        assert!(result.tier_shared.iter().any(|s| s.experience.id == peer.id));
        assert!(result.collective.iter().any(|s| s.experience.id == foreign.id));
        assert!(!ids.contains(&hidden.id));
        // The agent's own collective record is only listed once
        assert_eq!(ids.iter().filter(|id| **id == own.id).count(), 1);
    }

    #[tokio::test]
    async fn test_unhelpful_penalty_lowers_rank() {
        let f = fixture(8);
        let a = add(&f, "a", "t", "one", unit(8, 2), VisibilityScope::AgentLocal).await;
        let b = add(&f, "a", "t", "two", unit(8, 2), VisibilityScope::AgentLocal).await;
        f.index.set_unhelpful(&a, true);

        let result = f
            .retriever
            .query(&unit(8, 2), "q", &QueryFilters::new("a", "t"))
            .await
            .unwrap();
        assert_eq!(result.agent_local[0].experience.id, b.id);
        let flagged = result.agent_local.iter().find(|s| s.experience.id == a.id).unwrap();
        assert!(flagged.unhelpful);
    }

    #[tokio::test]
    async fn test_missing_record_is_dropped_and_counted() {
        let f = fixture(8);
        let kept = add(&f, "a", "t", "kept", unit(8, 3), VisibilityScope::AgentLocal).await;
        // Indexed but never stored
        let ghost =
            Experience::new("a".into(), "t".into(), TaskInput::new("ghost"), "o", "s", unit(8, 3));
        f.index.index(&ghost);

        let result = f
            .retriever
            .query(&unit(8, 3), "ghost", &QueryFilters::new("a", "t"))
            .await
            .unwrap();

        assert_eq!(result.ids(), vec![kept.id]);
        assert!(f.metrics.snapshot(0).index_inconsistencies >= 1);
        assert!(f.index.is_dirty(&ShardKey::Agent("a".into())));
    }

    #[tokio::test]
    async fn test_min_fitness_filter_and_limits() {
        let f = fixture(8);
        for i in 0..4 {
            let task = format!("t{}", i);
            let e = add(&f, "a", "t", &task, unit(8, 4), VisibilityScope::AgentLocal).await;
            f.store.adjust_fitness(&e.id, if i % 2 == 0 { 0.4 } else { -0.4 }).await.unwrap();
        }

        let filters = QueryFilters::new("a", "t").with_min_fitness(0.6).with_limits(10, 0, 0);
        let result = f.retriever.query(&unit(8, 4), "q", &filters).await.unwrap();
        assert_eq!(result.agent_local.len(), 2);
        assert!(result.iter().all(|s| s.experience.fitness_score >= 0.6));

        let limited = QueryFilters::new("a", "t").with_limits(1, 0, 0);
        let result = f.retriever.query(&unit(8, 4), "q", &limited).await.unwrap();
        assert_eq!(result.len(), 1);
    }
}
