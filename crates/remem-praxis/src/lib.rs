//! # ReMem PRAXIS
//!
//! Experience memory engine for multi-agent request serving: agents reuse
//! prior solutions found in sub-linear time, and every outcome re-weights how
//! useful those solutions are.
//!
//! ## Key Concepts
//!
//! - **Experience**: a resolved task with its output, strategy, embedding and fitness
//! - **Shard**: the index set over one agent, one tier, or the collective
//! - **Multi-index retrieval**: Bloom fast path, LSH candidates, PQ-guided graph search
//! - **ReMem loop**: RETRIEVE → THINK → ACT → REFLECT → EVOLVE, once per request
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    RememService                         │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐      │
//! │  │    Query    │  │ Store/Adjust│  │   Metrics   │      │
//! │  └──────┬──────┘  └──────┬──────┘  └──────┬──────┘      │
//! │         │                │                │             │
//! │  ┌──────┴──────┐  ┌──────┴────────┐       │             │
//! │  │ MultiIndex  │  │  Evolution    │       │             │
//! │  │ Retriever   │  │  Engine       │       │             │
//! │  └──────┬──────┘  └──────┬────────┘       │             │
//! │         │                │                │             │
//! │  ┌──────┴────────────────┴────────────────┴──────┐      │
//! │  │  ShardedIndex (per agent / tier / collective) │      │
//! │  │  ExperienceStore (authoritative)              │      │
//! │  └───────────────────────────────────────────────┘      │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod domain;
pub mod infra;
pub mod service;

// Re-export core types
pub use domain::augmentation::Augmentation;
pub use domain::collaborators::{
    AgentExecutor, AgentRequest, AgentResponse, CollaboratorError, Evaluation, OutcomeEvaluator,
};
pub use domain::control_loop::{LoopConfig, LoopRequest, LoopResponse, Phase, ReMemLoop};
pub use domain::evolution::{EvolutionEngine, EvolveInput, EvolveReport};
pub use domain::indexing::{ShardKey, ShardedIndex};
pub use domain::retrieval::{
    MultiIndexRetriever, QueryFilters, RankedResult, RetrievalConfig, ScoredExperience,
};

// Re-export infrastructure
pub use infra::embedding::{EmbeddingError, EmbeddingService, LocalEmbedding};
pub use infra::experience_store::{ExperienceStore, InMemoryStore, PutOutcome, StoreStats};
pub use infra::telemetry::{IndexOp, LatencySummary, MetricsSnapshot, RememMetrics};

pub use service::RememService;

/// PRAXIS version
pub const PRAXIS_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default embedding dimension
pub const DEFAULT_EMBEDDING_DIMENSION: usize = 256;

/// Default store capacity
pub const DEFAULT_STORE_CAPACITY: usize = 100_000;

/// Recency half-life in days
pub const DECAY_HALF_LIFE_DAYS: f64 = 30.0;
