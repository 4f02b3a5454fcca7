//! ReMem service
//!
//! Explicitly constructed handle owning the store, the sharded indices and
//! the engines built on them. Collaborators receive it by reference; there is
//! no global registry.

use std::path::Path;
use std::sync::Arc;

use prometheus::Registry;
use remem_common::{Experience, ExperienceId, RememError, Result, ValidationError};
use tracing::{info, instrument, warn};

use crate::config::RememConfig;
use crate::domain::collaborators::{AgentExecutor, OutcomeEvaluator};
use crate::domain::control_loop::{LoopConfig, LoopRequest, LoopResponse, ReMemLoop};
use crate::domain::evolution::EvolutionEngine;
use crate::domain::indexing::ShardedIndex;
use crate::domain::retrieval::{MultiIndexRetriever, QueryFilters, RankedResult, RetrievalConfig};
use crate::infra::embedding::{EmbeddingService, LocalEmbedding};
use crate::infra::experience_store::{ExperienceStore, InMemoryStore, StoreStats};
use crate::infra::snapshot;
use crate::infra::telemetry::{MetricsSnapshot, RememMetrics};

/// ReMem service handle
pub struct RememService {
    config: RememConfig,
    store: Arc<dyn ExperienceStore>,
    index: Arc<ShardedIndex>,
    retriever: Arc<MultiIndexRetriever>,
    evolution: Arc<EvolutionEngine>,
    embedder: Arc<dyn EmbeddingService>,
    metrics: Arc<RememMetrics>,
}

impl RememService {
    /// Build every component from configuration
    pub fn new(config: RememConfig) -> Result<Self> {
        config.validate()?;

        let dimension = config.store.dimension;
        let store: Arc<dyn ExperienceStore> = Arc::new(InMemoryStore::new(
            config.store.capacity,
            config.evolution.culling(),
        ));
        let embedder: Arc<dyn EmbeddingService> = Arc::new(LocalEmbedding::new(dimension));
        Self::with_parts(config, store, embedder)
    }

    /// Build around a caller-provided store and embedder
    pub fn with_parts(
        config: RememConfig,
        store: Arc<dyn ExperienceStore>,
        embedder: Arc<dyn EmbeddingService>,
    ) -> Result<Self> {
        config.validate()?;
        let dimension = config.store.dimension;
        if embedder.dimension() != dimension {
            return Err(ValidationError::DimensionMismatch {
                expected: dimension,
                actual: embedder.dimension(),
            }
            .into());
        }

        let metrics = Arc::new(
            RememMetrics::new().map_err(|e| RememError::Internal(format!("Metrics: {}", e)))?,
        );
        let index = Arc::new(ShardedIndex::new(dimension, config.index.clone()));
        let retriever = Arc::new(MultiIndexRetriever::new(
            store.clone(),
            index.clone(),
            RetrievalConfig::from(&config.retrieval),
            metrics.clone(),
        ));
        let evolution = Arc::new(EvolutionEngine::new(
            store.clone(),
            index.clone(),
            &config.evolution,
            metrics.clone(),
        ));

        info!(
            dimension,
            capacity = store.capacity(),
            "ReMem service initialized"
        );

        Ok(Self {
            config,
            store,
            index,
            retriever,
            evolution,
            embedder,
            metrics,
        })
    }

    pub fn config(&self) -> &RememConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ExperienceStore> {
        &self.store
    }

    pub fn index(&self) -> &Arc<ShardedIndex> {
        &self.index
    }

    pub fn embedder(&self) -> &Arc<dyn EmbeddingService> {
        &self.embedder
    }

    /// Ranked experiences for an embedding
    pub async fn query(
        &self,
        embedding: &[f32],
        task_text: &str,
        filters: &QueryFilters,
    ) -> Result<RankedResult> {
        self.retriever.query(embedding, task_text, filters).await
    }

    /// Ranked experiences for task text, embedded locally
    pub async fn query_text(
        &self,
        task_text: &str,
        filters: &QueryFilters,
    ) -> Result<RankedResult> {
        let embedding = self.embedder.embed_text(task_text).await?;
        self.retriever.query(&embedding, task_text, filters).await
    }

    /// Admit an experience
    pub async fn store_experience(&self, experience: Experience) -> Result<ExperienceId> {
        Ok(self.evolution.store_experience(experience).await?.id)
    }

    pub async fn get(&self, id: &ExperienceId) -> Result<Experience> {
        self.store.get(id).await
    }

    /// Adjust fitness by `delta`, clamped to [0, 1]
    pub async fn adjust_fitness(&self, id: &ExperienceId, delta: f32) -> Result<f32> {
        self.evolution.adjust_fitness(id, delta).await
    }

    /// Evict down to capacity
    pub async fn evict(&self) -> Result<Vec<ExperienceId>> {
        self.evolution.enforce_capacity().await
    }

    pub async fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot(self.store.len().await)
    }

    pub async fn stats(&self) -> StoreStats {
        self.store.stats().await
    }

    /// Expose the prometheus collectors
    pub fn register_metrics(&self, registry: &Registry) -> Result<()> {
        self.metrics
            .register(registry)
            .map_err(|e| RememError::Internal(format!("Metrics registration: {}", e)))
    }

    /// A control loop bound to this service
    pub fn control_loop(
        &self,
        executor: Arc<dyn AgentExecutor>,
        evaluator: Arc<dyn OutcomeEvaluator>,
    ) -> ReMemLoop {
        ReMemLoop::new(
            self.retriever.clone(),
            self.evolution.clone(),
            self.embedder.clone(),
            executor,
            evaluator,
            self.metrics.clone(),
            LoopConfig::from(&self.config.control_loop),
        )
    }

    /// One request through RETRIEVE → THINK → ACT → REFLECT → EVOLVE
    pub async fn run_loop(
        &self,
        request: LoopRequest,
        executor: Arc<dyn AgentExecutor>,
        evaluator: Arc<dyn OutcomeEvaluator>,
    ) -> Result<LoopResponse> {
        self.control_loop(executor, evaluator).run(request).await
    }

    /// Reconstruct every shard from the store
    #[instrument(skip(self))]
    pub async fn rebuild_indices(&self) -> usize {
        let records = self.store.all().await;
        self.index.rebuild_all(&records);
        records.len()
    }

    /// Write every record to `path`
    pub async fn snapshot(&self, path: &Path) -> Result<usize> {
        let records = self.store.all().await;
        snapshot::save(path, self.config.store.dimension, &records).await?;
        Ok(records.len())
    }

    /// Replay a snapshot into the store, then rebuild every shard.
    ///
    /// Records are admitted oldest first; invalid or duplicate records are
    /// skipped.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub async fn restore(&self, path: &Path) -> Result<usize> {
        let (header, records) = snapshot::load(path).await?;
        let dimension = self.config.store.dimension;
        if header.dimension != dimension {
            return Err(ValidationError::DimensionMismatch {
                expected: dimension,
                actual: header.dimension,
            }
            .into());
        }

        let mut restored = 0usize;
        for record in records {
            let id = record.id;
            if let Err(e) = record.validate(dimension) {
                warn!(%id, error = %e, "Skipping invalid snapshot record");
                continue;
            }
            match self.store.put(record).await {
                Ok(_) => restored += 1,
                Err(e @ RememError::CapacityExhausted { .. }) => return Err(e),
                Err(e) => warn!(%id, error = %e, "Skipping snapshot record"),
            }
        }

        self.rebuild_indices().await;
        self.metrics.set_store_size(self.store.len().await);
        info!(restored, "Snapshot restored");
        Ok(restored)
    }

    /// Write the snapshot if one is configured
    pub async fn shutdown(&self) -> Result<()> {
        match &self.config.store.snapshot_path {
            Some(path) => {
                let written = self.snapshot(path).await?;
                info!(records = written, "ReMem service stopped");
            }
            None => info!("ReMem service stopped without snapshot"),
        }
        Ok(())
    }
}
