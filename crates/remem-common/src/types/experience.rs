//! Experience records
//!
//! Each experience captures one resolved task:
//! - the input task (text + structured context)
//! - the produced output and the strategy that produced it
//! - a fixed-dimension embedding of the task
//! - mutable usefulness metadata (fitness, usage, last access, visibility)
//!
//! Only `fitness_score`, `usage_count`, `last_access_at`, `visibility` and
//! `breakthrough_at` change after creation, and only through the store's
//! evolution operations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::ids::{AgentId, ExperienceId, TierId};
use super::scope::VisibilityScope;
use crate::error::ValidationError;

/// Normalise task text for exact-match keys: lowercase, single spaces, trimmed.
pub fn normalize_task(text: &str) -> String {
    text.split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Inbound task description
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TaskInput {
    /// Task text as submitted
    pub text: String,

    /// Optional structured context (key-value)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, String>,
}

impl TaskInput {
    /// Create a task with no structured context
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            context: BTreeMap::new(),
        }
    }

    /// Add a context entry
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Normalised form of the task text
    pub fn normalized(&self) -> String {
        normalize_task(&self.text)
    }
}

/// A stored task/solution pair with quality and provenance metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experience {
    /// Unique experience identifier
    pub id: ExperienceId,

    /// Task that was resolved
    pub input_task: TaskInput,

    /// Produced solution text
    pub output: String,

    /// Short descriptor of the approach used
    pub strategy: String,

    /// Task embedding (dimension fixed per deployment)
    pub embedding: Vec<f32>,

    /// Historical usefulness in [0, 1]
    pub fitness_score: f32,

    /// Number of times consulted during augmentation
    pub usage_count: u64,

    /// When this experience was created
    pub created_at: DateTime<Utc>,

    /// Last time it was consulted (or created)
    pub last_access_at: DateTime<Utc>,

    /// Agent that produced it
    pub agent_id: AgentId,

    /// Tier of the producing agent
    pub tier_id: TierId,

    /// Current visibility
    pub visibility: VisibilityScope,

    /// When fitness first crossed the breakthrough threshold
    #[serde(default)]
    pub breakthrough_at: Option<DateTime<Utc>>,
}

impl Experience {
    /// Create a new experience with neutral fitness
    pub fn new(
        agent_id: AgentId,
        tier_id: TierId,
        input_task: TaskInput,
        output: impl Into<String>,
        strategy: impl Into<String>,
        embedding: Vec<f32>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ExperienceId::new(),
            input_task,
            output: output.into(),
            strategy: strategy.into(),
            embedding,
            fitness_score: 0.5,
            usage_count: 0,
            created_at: now,
            last_access_at: now,
            agent_id,
            tier_id,
            visibility: VisibilityScope::AgentLocal,
            breakthrough_at: None,
        }
    }

    /// Create a builder for Experience
    pub fn builder(agent_id: impl Into<AgentId>, tier_id: impl Into<TierId>) -> ExperienceBuilder {
        ExperienceBuilder::new(agent_id.into(), tier_id.into())
    }

    /// Check the record against the deployment's embedding dimension
    pub fn validate(&self, dimension: usize) -> Result<(), ValidationError> {
        if self.input_task.text.trim().is_empty() {
            return Err(ValidationError::EmptyTask);
        }
        if self.embedding.len() != dimension {
            return Err(ValidationError::DimensionMismatch {
                expected: dimension,
                actual: self.embedding.len(),
            });
        }
        if self.embedding.iter().any(|x| !x.is_finite()) {
            return Err(ValidationError::NonFiniteEmbedding);
        }
        if !(0.0..=1.0).contains(&self.fitness_score) || self.fitness_score.is_nan() {
            return Err(ValidationError::FitnessOutOfRange(self.fitness_score));
        }
        Ok(())
    }

    /// Whether fitness has ever crossed the breakthrough threshold
    pub fn is_breakthrough(&self) -> bool {
        self.breakthrough_at.is_some()
    }

    /// Normalised task text (exact-match key)
    pub fn task_key(&self) -> String {
        self.input_task.normalized()
    }

    /// Days since last access
    pub fn idle_days(&self, now: DateTime<Utc>) -> f64 {
        let duration = now - self.last_access_at;
        (duration.num_milliseconds() as f64 / 86_400_000.0).max(0.0)
    }

    /// Exponential recency factor in (0, 1], computed from `last_access_at`.
    ///
    /// Does not touch the stored fitness.
    pub fn time_decay_factor(&self, half_life_days: f64, now: DateTime<Utc>) -> f32 {
        if half_life_days <= 0.0 {
            return 1.0;
        }
        0.5_f64.powf(self.idle_days(now) / half_life_days) as f32
    }
}

/// Builder for Experience
#[derive(Debug)]
pub struct ExperienceBuilder {
    agent_id: AgentId,
    tier_id: TierId,
    input_task: Option<TaskInput>,
    output: Option<String>,
    strategy: Option<String>,
    embedding: Option<Vec<f32>>,
    fitness_score: f32,
    visibility: VisibilityScope,
}

impl ExperienceBuilder {
    /// Create a new builder
    pub fn new(agent_id: AgentId, tier_id: TierId) -> Self {
        Self {
            agent_id,
            tier_id,
            input_task: None,
            output: None,
            strategy: None,
            embedding: None,
            fitness_score: 0.5,
            visibility: VisibilityScope::AgentLocal,
        }
    }

    /// Set the task
    pub fn task(mut self, task: TaskInput) -> Self {
        self.input_task = Some(task);
        self
    }

    /// Set the output
    pub fn output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    /// Set the strategy
    pub fn strategy(mut self, strategy: impl Into<String>) -> Self {
        self.strategy = Some(strategy.into());
        self
    }

    /// Set the embedding
    pub fn embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// Set the initial fitness
    pub fn fitness(mut self, fitness: f32) -> Self {
        self.fitness_score = fitness;
        self
    }

    /// Set the initial visibility
    pub fn visibility(mut self, visibility: VisibilityScope) -> Self {
        self.visibility = visibility;
        self
    }

    /// Build the Experience
    pub fn build(self) -> Result<Experience, ValidationError> {
        let input_task = self.input_task.ok_or(ValidationError::MissingField("input_task"))?;
        let embedding = self.embedding.ok_or(ValidationError::MissingField("embedding"))?;
        if !(0.0..=1.0).contains(&self.fitness_score) {
            return Err(ValidationError::FitnessOutOfRange(self.fitness_score));
        }

        let mut experience = Experience::new(
            self.agent_id,
            self.tier_id,
            input_task,
            self.output.unwrap_or_default(),
            self.strategy.unwrap_or_default(),
            embedding,
        );
        experience.fitness_score = self.fitness_score;
        experience.visibility = self.visibility;

        Ok(experience)
    }
}
