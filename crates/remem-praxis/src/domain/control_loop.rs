//! ReMem control loop
//!
//! `RETRIEVE → THINK → ACT → REFLECT → EVOLVE → done`, once per request.
//!
//! Collaborator faults never abort the loop: a failed or timed-out ACT goes
//! straight to EVOLVE as a failure, an unavailable evaluator counts as
//! `success = false, quality = 0`. EVOLVE runs on its own task so a caller
//! dropping the request cannot tear a write.

use std::sync::Arc;
use std::time::Duration;

use remem_common::{AgentId, ExperienceId, RememError, Result, TaskInput, TierId};
use remem_darwinian::Outcome;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::augmentation::Augmentation;
use super::collaborators::{
    AgentExecutor, AgentRequest, AgentResponse, Evaluation, OutcomeEvaluator,
};
use super::evolution::{EvolutionEngine, EvolveInput};
use super::retrieval::{MultiIndexRetriever, QueryFilters};
use crate::config::ControlLoopSettings;
use crate::infra::embedding::EmbeddingService;
use crate::infra::telemetry::RememMetrics;

/// Loop states, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Retrieve,
    Think,
    Act,
    Reflect,
    Evolve,
    Done,
}

#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub act_timeout: Duration,
    pub reflect_timeout: Duration,
    pub max_augmentation_entries: usize,
    pub max_augmentation_chars: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self::from(&ControlLoopSettings::default())
    }
}

impl From<&ControlLoopSettings> for LoopConfig {
    fn from(settings: &ControlLoopSettings) -> Self {
        Self {
            act_timeout: Duration::from_millis(settings.act_timeout_ms),
            reflect_timeout: Duration::from_millis(settings.reflect_timeout_ms),
            max_augmentation_entries: settings.max_augmentation_entries,
            max_augmentation_chars: settings.max_augmentation_chars,
        }
    }
}

/// One inbound task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopRequest {
    pub agent_id: AgentId,
    pub tier_id: TierId,
    pub task: TaskInput,
    /// Computed from the task text when absent
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
}

impl LoopRequest {
    pub fn new(agent_id: impl Into<AgentId>, tier_id: impl Into<TierId>, task: TaskInput) -> Self {
        Self {
            agent_id: agent_id.into(),
            tier_id: tier_id.into(),
            task,
            embedding: None,
        }
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }
}

/// Result of one loop run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopResponse {
    pub output: String,
    pub strategy: String,
    pub success: bool,
    pub quality: f64,
    /// The new experience; `None` when capacity was exhausted
    pub experience_id: Option<ExperienceId>,
    /// Experiences shown to the agent
    pub consulted: Vec<ExperienceId>,
    /// States actually visited
    pub phases: Vec<Phase>,
    /// ACT fault, if any
    pub act_error: Option<String>,
}

/// Per-request control loop
pub struct ReMemLoop {
    retriever: Arc<MultiIndexRetriever>,
    evolution: Arc<EvolutionEngine>,
    embedder: Arc<dyn EmbeddingService>,
    executor: Arc<dyn AgentExecutor>,
    evaluator: Arc<dyn OutcomeEvaluator>,
    metrics: Arc<RememMetrics>,
    config: LoopConfig,
}

impl ReMemLoop {
    pub fn new(
        retriever: Arc<MultiIndexRetriever>,
        evolution: Arc<EvolutionEngine>,
        embedder: Arc<dyn EmbeddingService>,
        executor: Arc<dyn AgentExecutor>,
        evaluator: Arc<dyn OutcomeEvaluator>,
        metrics: Arc<RememMetrics>,
        config: LoopConfig,
    ) -> Self {
        Self {
            retriever,
            evolution,
            embedder,
            executor,
            evaluator,
            metrics,
            config,
        }
    }

    /// Run the loop for one request.
    ///
    /// Errors only on invalid input or a failed EVOLVE write.
    #[instrument(skip_all, fields(agent = %request.agent_id, tier = %request.tier_id))]
    pub async fn run(&self, request: LoopRequest) -> Result<LoopResponse> {
        let mut phases = Vec::with_capacity(6);

        let embedding = match request.embedding {
            Some(embedding) => embedding,
            None => self.embedder.embed_text(&request.task.text).await?,
        };

        // RETRIEVE
        phases.push(Phase::Retrieve);
        let filters = QueryFilters::new(request.agent_id.clone(), request.tier_id.clone());
        let ranked = self
            .retriever
            .query(&embedding, &request.task.text, &filters)
            .await?;

        // THINK
        phases.push(Phase::Think);
        let augmentation = Augmentation::from_ranked(
            &ranked,
            self.config.max_augmentation_entries,
            self.config.max_augmentation_chars,
        );
        let consulted = augmentation.consulted();
        debug!(retrieved = ranked.len(), consulted = consulted.len(), "Augmentation built");

        let agent_request = AgentRequest {
            agent_id: request.agent_id.clone(),
            tier_id: request.tier_id.clone(),
            task: request.task.clone(),
            augmentation: augmentation.text,
        };

        // ACT
        phases.push(Phase::Act);
        let acted = match tokio::time::timeout(
            self.config.act_timeout,
            self.executor.execute(&agent_request),
        )
        .await
        {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("timed out after {:?}", self.config.act_timeout)),
        };

        // REFLECT
        let (response, evaluation, act_error) = match acted {
            Ok(response) => {
                phases.push(Phase::Reflect);
                let evaluation = self.reflect(&agent_request, &response).await;
                (response, evaluation, None)
            }
            Err(error) => {
                warn!(error = %error, "Agent execution failed");
                (AgentResponse::default(), Evaluation::unavailable(), Some(error))
            }
        };

        // EVOLVE
        phases.push(Phase::Evolve);
        let input = EvolveInput {
            agent_id: request.agent_id,
            tier_id: request.tier_id,
            task: request.task,
            output: response.output.clone(),
            strategy: response.strategy.clone(),
            embedding,
            consulted: consulted.clone(),
            outcome: Outcome::from_success(evaluation.success),
            quality: evaluation.quality,
        };
        let engine = Arc::clone(&self.evolution);
        let report = tokio::spawn(async move { engine.evolve(input).await })
            .await
            .map_err(|e| RememError::Internal(format!("EVOLVE task failed: {}", e)))??;

        phases.push(Phase::Done);
        self.metrics.record_loop(evaluation.success);
        info!(
            success = evaluation.success,
            quality = evaluation.quality,
            consulted = consulted.len(),
            "Loop complete"
        );

        Ok(LoopResponse {
            output: response.output,
            strategy: response.strategy,
            success: evaluation.success,
            quality: evaluation.quality,
            experience_id: report.experience_id,
            consulted,
            phases,
            act_error,
        })
    }

    async fn reflect(&self, request: &AgentRequest, response: &AgentResponse) -> Evaluation {
        match tokio::time::timeout(
            self.config.reflect_timeout,
            self.evaluator.evaluate(request, response),
        )
        .await
        {
            Ok(Ok(evaluation)) => evaluation,
            Ok(Err(e)) => {
                warn!(error = %e, "Outcome evaluator unavailable");
                Evaluation::unavailable()
            }
            Err(_) => {
                warn!(timeout = ?self.config.reflect_timeout, "Outcome evaluator timed out");
                Evaluation::unavailable()
            }
        }
    }
}
