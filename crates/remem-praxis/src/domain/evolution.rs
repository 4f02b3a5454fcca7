//! Fitness & Evolution Engine
//!
//! Every write path goes through here:
//!
//! - admitting new experiences (store first, then every shard they belong to)
//! - outcome feedback on consulted experiences, with promotion
//! - the over-capacity sweep at the end of EVOLVE
//!
//! The store is authoritative. A failed index write never rolls back a store
//! write; drifted shards are rebuilt on their next write.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use remem_common::{
    AgentId, Experience, ExperienceId, RememError, Result, TaskInput, TierId, VisibilityScope,
};
use remem_darwinian::{DarwinianConfig, FitnessCalculator, Outcome, PromotionPolicy};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::indexing::{ShardKey, ShardedIndex};
use crate::infra::experience_store::{ExperienceStore, PutOutcome};
use crate::infra::telemetry::{IndexOp, RememMetrics};

/// Everything EVOLVE needs from one completed request
#[derive(Debug, Clone)]
pub struct EvolveInput {
    pub agent_id: AgentId,
    pub tier_id: TierId,
    pub task: TaskInput,
    pub output: String,
    pub strategy: String,
    pub embedding: Vec<f32>,
    /// Experiences shown to the agent during THINK
    pub consulted: Vec<ExperienceId>,
    pub outcome: Outcome,
    /// REFLECT quality estimate; becomes the new record's fitness
    pub quality: f64,
}

/// What EVOLVE changed
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvolveReport {
    /// The new record, unless capacity was exhausted
    pub experience_id: Option<ExperienceId>,
    /// Consulted records with their new fitness
    pub adjusted: Vec<(ExperienceId, f32)>,
    /// Records whose visibility widened
    pub promoted: Vec<(ExperienceId, VisibilityScope)>,
    pub evicted: Vec<ExperienceId>,
}

/// Fitness & evolution engine
pub struct EvolutionEngine {
    store: Arc<dyn ExperienceStore>,
    index: Arc<ShardedIndex>,
    calculator: FitnessCalculator,
    promotion: PromotionPolicy,
    metrics: Arc<RememMetrics>,
}

impl EvolutionEngine {
    pub fn new(
        store: Arc<dyn ExperienceStore>,
        index: Arc<ShardedIndex>,
        config: &DarwinianConfig,
        metrics: Arc<RememMetrics>,
    ) -> Self {
        Self {
            store,
            index,
            calculator: config.calculator(),
            promotion: config.promotion(),
            metrics,
        }
    }

    pub fn calculator(&self) -> FitnessCalculator {
        self.calculator
    }

    /// Run the EVOLVE phase for one request
    #[instrument(skip_all, fields(agent = %input.agent_id, outcome = ?input.outcome))]
    pub async fn evolve(&self, input: EvolveInput) -> Result<EvolveReport> {
        let now = Utc::now();
        let mut report = EvolveReport::default();

        let experience = Experience::builder(input.agent_id, input.tier_id)
            .task(input.task)
            .output(input.output)
            .strategy(input.strategy)
            .embedding(input.embedding)
            .fitness(FitnessCalculator::initial(input.quality))
            .build()?;

        match self.store_experience(experience).await {
            Ok(outcome) => {
                report.experience_id = Some(outcome.id);
                report.evicted.extend(outcome.evicted.iter().map(|e| e.id));
            }
            Err(e @ RememError::CapacityExhausted { .. }) => {
                warn!(error = %e, "New experience rejected; applying feedback only");
            }
            Err(e) => return Err(e),
        }

        let mut seen = HashSet::new();
        for id in input.consulted.iter().filter(|id| seen.insert(**id)) {
            match self.apply_outcome(id, input.outcome, now).await {
                Ok((fitness, promoted)) => {
                    report.adjusted.push((*id, fitness));
                    if let Some(scope) = promoted {
                        report.promoted.push((*id, scope));
                    }
                }
                Err(RememError::NotFound(_)) => {
                    debug!(%id, "Consulted experience no longer stored");
                }
                Err(e) => warn!(%id, error = %e, "Failed to apply outcome"),
            }
        }

        match self.enforce_capacity().await {
            Ok(evicted) => report.evicted.extend(evicted),
            Err(e) => warn!(error = %e, "Capacity sweep failed"),
        }

        info!(
            experience = ?report.experience_id,
            adjusted = report.adjusted.len(),
            promoted = report.promoted.len(),
            evicted = report.evicted.len(),
            "EVOLVE complete"
        );
        Ok(report)
    }

    /// Validate, store and index a record.
    ///
    /// Visibility is widened to what the record's fitness already earns.
    #[instrument(skip_all, fields(id = %experience.id, agent = %experience.agent_id))]
    pub async fn store_experience(&self, mut experience: Experience) -> Result<PutOutcome> {
        experience.validate(self.index.dimension())?;
        let start = Instant::now();

        experience.visibility = experience
            .visibility
            .widen(self.promotion.scope_for(experience.fitness_score));
        if experience.visibility == VisibilityScope::Collective
            && experience.breakthrough_at.is_none()
        {
            experience.breakthrough_at = Some(Utc::now());
        }

        let outcome = self.store.put(experience.clone()).await?;

        for evicted in &outcome.evicted {
            self.index.remove(evicted);
        }
        if !outcome.evicted.is_empty() {
            self.metrics.record_evictions(outcome.evicted.len());
        }

        let keys = self.index.index(&experience);
        self.drop_if_evicted(&experience).await;
        self.repair(&keys).await;

        if experience.visibility == VisibilityScope::Collective {
            self.metrics.record_breakthrough();
        }
        self.metrics.observe(IndexOp::Insert, start.elapsed());
        self.metrics.set_store_size(self.store.len().await);

        Ok(outcome)
    }

    /// Raw fitness adjustment, followed by any promotion it earns
    pub async fn adjust_fitness(&self, id: &ExperienceId, delta: f32) -> Result<f32> {
        let fitness = self.store.adjust_fitness(id, delta).await?;
        self.promote_if_due(id, fitness, Utc::now()).await?;
        Ok(fitness)
    }

    /// Evict down to capacity and drop the victims from every shard
    pub async fn enforce_capacity(&self) -> Result<Vec<ExperienceId>> {
        let start = Instant::now();
        let evicted = self.store.evict().await?;
        if evicted.is_empty() {
            return Ok(Vec::new());
        }

        for experience in &evicted {
            self.index.remove(experience);
        }
        self.metrics.record_evictions(evicted.len());
        self.metrics.observe(IndexOp::Evict, start.elapsed());
        self.metrics.set_store_size(self.store.len().await);

        Ok(evicted.iter().map(|e| e.id).collect())
    }

    /// Feedback for one consulted record: fitness, usage, popularity, the
    /// unhelpful flag, then promotion.
    async fn apply_outcome(
        &self,
        id: &ExperienceId,
        outcome: Outcome,
        now: DateTime<Utc>,
    ) -> Result<(f32, Option<VisibilityScope>)> {
        let fitness = self
            .store
            .adjust_fitness(id, self.calculator.delta(outcome))
            .await?;
        self.store.touch(id, now).await?;

        let record = self.store.get(id).await?;
        self.index.record_retrieval(&record);
        self.index.set_unhelpful(&record, !outcome.is_success());

        let promoted = self.promote_if_due(id, fitness, now).await?;
        Ok((fitness, promoted))
    }

    /// Widen visibility if `fitness` crosses a threshold, then index the
    /// record into the shards it just joined
    async fn promote_if_due(
        &self,
        id: &ExperienceId,
        fitness: f32,
        now: DateTime<Utc>,
    ) -> Result<Option<VisibilityScope>> {
        let target = self.promotion.scope_for(fitness);
        let Some(scope) = self.store.promote(id, target, now).await? else {
            return Ok(None);
        };

        let record = self.store.get(id).await?;
        let joined: Vec<ShardKey> = ShardKey::holding(&record)
            .into_iter()
            .filter(|key| !self.index.contains(key, id))
            .collect();
        for key in &joined {
            self.index.insert_into(key, &record);
        }
        self.drop_if_evicted(&record).await;
        self.repair(&joined).await;

        if scope == VisibilityScope::Collective {
            self.metrics.record_breakthrough();
            info!(%id, fitness, "Experience promoted to collective");
        } else {
            info!(%id, fitness, scope = ?scope, "Experience promoted");
        }
        Ok(Some(scope))
    }

    /// Undo an index write whose record a concurrent put already evicted.
    ///
    /// The evicting writer removes from the index after the store, so either
    /// it sees this write or this check sees its removal.
    async fn drop_if_evicted(&self, experience: &Experience) {
        if let Err(RememError::NotFound(_)) = self.store.get(&experience.id).await {
            debug!(id = %experience.id, "Record evicted while indexing");
            self.index.remove(experience);
        }
    }

    /// Rebuild any of `keys` flagged dirty, from the store
    async fn repair(&self, keys: &[ShardKey]) {
        for key in keys {
            if self.index.is_dirty(key) {
                let records = self.store.shard_records(key).await;
                self.index.rebuild_shard(key, &records);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::experience_store::InMemoryStore;
    use remem_index::IndexConfig;

    const DIM: usize = 4;

    struct Fixture {
        store: Arc<InMemoryStore>,
        index: Arc<ShardedIndex>,
        engine: EvolutionEngine,
        metrics: Arc<RememMetrics>,
    }

    fn fixture(capacity: usize) -> Fixture {
        let config = DarwinianConfig::default();
        let store = Arc::new(InMemoryStore::new(capacity, config.culling()));
        let index = Arc::new(ShardedIndex::new(DIM, IndexConfig::default()));
        let metrics = Arc::new(RememMetrics::new().unwrap());
        let engine = EvolutionEngine::new(store.clone(), index.clone(), &config, metrics.clone());
        Fixture {
            store,
            index,
            engine,
            metrics,
        }
    }

    fn experience(agent: &str, fitness: f32) -> Experience {
        Experience::builder(agent, "t")
            .task(TaskInput::new(format!("task of {}", agent)))
            .output("out")
            .strategy("s")
            .embedding(vec![0.5; DIM])
            .fitness(fitness)
            .build()
            .unwrap()
    }

    fn input(consulted: Vec<ExperienceId>, outcome: Outcome, quality: f64) -> EvolveInput {
        EvolveInput {
            agent_id: "a".into(),
            tier_id: "t".into(),
            task: TaskInput::new("new task"),
            output: "answer".into(),
            strategy: "greedy".into(),
            embedding: vec![0.1; DIM],
            consulted,
            outcome,
            quality,
        }
    }

    #[tokio::test]
    async fn test_store_indexes_record() {
        let f = fixture(10);
        let e = experience("a", 0.5);
        let id = f.engine.store_experience(e).await.unwrap().id;
        assert!(f.index.contains(&ShardKey::Agent("a".into()), &id));
        assert!(!f.index.contains(&ShardKey::Tier("t".into()), &id));
        assert_eq!(f.metrics.latency(IndexOp::Insert).samples, 1);
    }

    #[tokio::test]
    async fn test_store_rejects_wrong_dimension() {
        let f = fixture(10);
        let mut e = experience("a", 0.5);
        e.embedding = vec![1.0; DIM + 1];
        let err = f.engine.store_experience(e).await.unwrap_err();
        assert!(matches!(err, RememError::Validation(_)));
        assert_eq!(f.store.len().await, 0);
    }

    #[tokio::test]
    async fn test_high_fitness_record_is_stored_wide() {
        let f = fixture(10);
        let id = f.engine.store_experience(experience("a", 0.95)).await.unwrap().id;
        let stored = f.store.get(&id).await.unwrap();
        assert_eq!(stored.visibility, VisibilityScope::Collective);
        assert!(stored.is_breakthrough());
        assert!(f.index.contains(&ShardKey::Collective, &id));
    }

    #[tokio::test]
    async fn test_failure_decreases_by_failure_delta() {
        let f = fixture(10);
        let used = f.engine.store_experience(experience("a", 0.5)).await.unwrap().id;
        let floor = f.engine.store_experience(experience("b", 0.0)).await.unwrap().id;

        let report = f
            .engine
            .evolve(input(vec![used, floor], Outcome::Failure, 0.2))
            .await
            .unwrap();

        let used_fitness = f.store.get(&used).await.unwrap().fitness_score;
        assert!((used_fitness - 0.48).abs() < 1e-6);
        assert_eq!(f.store.get(&floor).await.unwrap().fitness_score, 0.0);
        assert_eq!(report.adjusted.len(), 2);

        let record = f.store.get(&used).await.unwrap();
        assert_eq!(record.usage_count, 1);
        let shard = f.index.shard(&ShardKey::Agent("a".into())).unwrap();
        assert!(shard.read().is_unhelpful(&used));
        assert_eq!(shard.read().popularity(&used), 1);
    }

    #[tokio::test]
    async fn test_success_clears_unhelpful_and_promotes() {
        let f = fixture(10);
        let id = f.engine.store_experience(experience("a", 0.68)).await.unwrap().id;

        f.engine.evolve(input(vec![id], Outcome::Failure, 0.5)).await.unwrap();
        let report = f
            .engine
            .evolve(input(vec![id, id], Outcome::Success, 0.5))
            .await
            .unwrap();

        // 0.68 - 0.02 + 0.05, duplicate consult counted once
        let record = f.store.get(&id).await.unwrap();
        assert!((record.fitness_score - 0.71).abs() < 1e-5);
        assert_eq!(report.adjusted.len(), 1);
        assert_eq!(report.promoted, vec![(id, VisibilityScope::TierShared)]);
        assert!(f.index.contains(&ShardKey::Tier("t".into()), &id));

        let shard = f.index.shard(&ShardKey::Agent("a".into())).unwrap();
        assert!(!shard.read().is_unhelpful(&id));
    }

    #[tokio::test]
    async fn test_new_record_takes_clamped_quality() {
        let f = fixture(10);
        let report = f.engine.evolve(input(vec![], Outcome::Success, 7.0)).await.unwrap();
        let id = report.experience_id.unwrap();
        let record = f.store.get(&id).await.unwrap();
        assert_eq!(record.fitness_score, 1.0);
        assert_eq!(record.visibility, VisibilityScope::Collective);
        assert_eq!(f.metrics.snapshot(0).breakthrough_count, 1);
    }

    #[tokio::test]
    async fn test_evicted_records_leave_the_index() {
        let f = fixture(2);
        let low = f.engine.store_experience(experience("a", 0.1)).await.unwrap().id;
        f.engine.store_experience(experience("a", 0.5)).await.unwrap();

        let report = f.engine.evolve(input(vec![], Outcome::Success, 0.6)).await.unwrap();
        assert_eq!(report.evicted, vec![low]);
        assert!(!f.index.contains(&ShardKey::Agent("a".into()), &low));
        assert_eq!(f.store.len().await, 2);
        assert_eq!(f.metrics.snapshot(0).eviction_count, 1);
    }

    #[tokio::test]
    async fn test_capacity_exhaustion_still_applies_feedback() {
        let f = fixture(1);
        let protected = f.engine.store_experience(experience("a", 0.95)).await.unwrap().id;

        let report = f
            .engine
            .evolve(input(vec![protected], Outcome::Failure, 0.3))
            .await
            .unwrap();
        assert_eq!(report.experience_id, None);
        assert_eq!(report.adjusted.len(), 1);
        assert_eq!(f.store.len().await, 1);
    }

    #[tokio::test]
    async fn test_missing_consulted_record_is_skipped() {
        let f = fixture(10);
        let report = f
            .engine
            .evolve(input(vec![ExperienceId::new()], Outcome::Success, 0.5))
            .await
            .unwrap();
        assert!(report.adjusted.is_empty());
        assert!(report.experience_id.is_some());
    }

    #[tokio::test]
    async fn test_dirty_shard_rebuilt_on_next_write() {
        let f = fixture(10);
        let e = experience("a", 0.5);
        let id = e.id;
        f.engine.store_experience(e).await.unwrap();
        let key = ShardKey::Agent("a".into());
        f.index.mark_dirty(&key);

        f.engine.store_experience(experience("a", 0.4)).await.unwrap();
        assert!(!f.index.is_dirty(&key));
        assert!(f.index.contains(&key, &id));
    }

    #[tokio::test]
    async fn test_adjust_fitness_promotes() {
        let f = fixture(10);
        let id = f.engine.store_experience(experience("a", 0.5)).await.unwrap().id;
        assert_eq!(f.engine.adjust_fitness(&id, 0.45).await.unwrap(), 0.95);
        assert!(f.index.contains(&ShardKey::Collective, &id));
        assert!(matches!(
            f.engine.adjust_fitness(&ExperienceId::new(), 0.1).await,
            Err(RememError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_index_write_for_evicted_record_is_undone() {
        let f = fixture(10);
        let kept = f.engine.store_experience(experience("a", 0.5)).await.unwrap().id;

        // Indexed, but a concurrent put already evicted it from the store
        let gone = experience("a", 0.2);
        f.index.index(&gone);
        f.engine.drop_if_evicted(&gone).await;

        let key = ShardKey::Agent("a".into());
        assert!(!f.index.contains(&key, &gone.id));
        assert!(f.index.contains(&key, &kept));

        let record = f.store.get(&kept).await.unwrap();
        f.engine.drop_if_evicted(&record).await;
        assert!(f.index.contains(&key, &kept));
    }
}
