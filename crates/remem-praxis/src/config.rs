//! ReMem configuration

use std::path::PathBuf;

use config::{Config, Environment, File};
use remem_common::{RememError, Result};
use remem_darwinian::DarwinianConfig;
use remem_index::IndexConfig;
use serde::{Deserialize, Serialize};

/// Environment variable naming the config file
pub const CONFIG_PATH_ENV: &str = "REMEM_CONFIG";

/// Default config file, read when present
pub const DEFAULT_CONFIG_FILE: &str = "remem.toml";

/// ReMem service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RememConfig {
    /// Experience store settings
    pub store: StoreSettings,
    /// Retrieval settings
    pub retrieval: RetrievalSettings,
    /// Index structure tuning
    pub index: IndexConfig,
    /// Fitness evolution policy
    pub evolution: DarwinianConfig,
    /// Control loop settings
    pub control_loop: ControlLoopSettings,
}

impl RememConfig {
    /// Load configuration from `.env`, an optional file and `REMEM__*` variables.
    ///
    /// Later sources win: defaults, then file, then environment
    /// (`REMEM__STORE__CAPACITY=5000`).
    pub fn load() -> Result<Self> {
        let _ = dotenvy::dotenv();

        let path =
            std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());

        let settings = Config::builder()
            .add_source(Config::try_from(&Self::default()).map_err(config_error)?)
            .add_source(File::with_name(&path).required(false))
            .add_source(
                Environment::with_prefix("REMEM")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(config_error)?;

        let cfg: Self = settings.try_deserialize().map_err(config_error)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(RememError::Config(msg));

        if self.store.dimension == 0 {
            return fail("store.dimension must be positive".into());
        }
        if self.store.capacity == 0 {
            return fail("store.capacity must be positive".into());
        }

        for (name, value) in [
            ("evolution.tier_share_threshold", self.evolution.tier_share_threshold),
            ("evolution.breakthrough_threshold", self.evolution.breakthrough_threshold),
            ("evolution.success_delta", self.evolution.success_delta),
            ("evolution.failure_delta", self.evolution.failure_delta),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return fail(format!("{} must be within [0, 1], got {}", name, value));
            }
        }
        if self.evolution.tier_share_threshold > self.evolution.breakthrough_threshold {
            return fail("evolution.tier_share_threshold exceeds breakthrough_threshold".into());
        }

        if self.index.lsh_bits == 0 || self.index.lsh_bits > 64 {
            return fail(format!(
                "index.lsh_bits must be within 1..=64, got {}",
                self.index.lsh_bits
            ));
        }
        if self.index.pq_subspaces == 0 || self.index.pq_subspaces > self.store.dimension {
            return fail(format!(
                "index.pq_subspaces must be within 1..={}, got {}",
                self.store.dimension, self.index.pq_subspaces
            ));
        }
        if self.index.pq_centroids == 0 || self.index.pq_centroids > 256 {
            return fail(format!(
                "index.pq_centroids must be within 1..=256, got {}",
                self.index.pq_centroids
            ));
        }
        if !(0.0..1.0).contains(&self.index.bloom_fp_rate) || self.index.bloom_fp_rate == 0.0 {
            return fail(format!(
                "index.bloom_fp_rate must be within (0, 1), got {}",
                self.index.bloom_fp_rate
            ));
        }
        if self.retrieval.unhelpful_penalty < 0.0 {
            return fail("retrieval.unhelpful_penalty must be non-negative".into());
        }

        Ok(())
    }
}

fn config_error(e: config::ConfigError) -> RememError {
    RememError::Config(e.to_string())
}

/// Experience store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// Embedding dimension, fixed per deployment
    pub dimension: usize,
    /// Maximum number of stored experiences
    pub capacity: usize,
    /// Snapshot file written on shutdown and replayed on startup
    pub snapshot_path: Option<PathBuf>,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            dimension: crate::DEFAULT_EMBEDDING_DIMENSION,
            capacity: crate::DEFAULT_STORE_CAPACITY,
            snapshot_path: None,
        }
    }
}

/// Weights of the retrieval score terms
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    /// Weight of the negative embedding distance
    pub distance: f32,
    /// Weight of the (log-scaled) retrieval popularity
    pub popularity: f32,
    /// Weight of the stored fitness score
    pub fitness: f32,
    /// Weight of the recency decay factor
    pub recency: f32,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            distance: 1.0,
            popularity: 0.1,
            fitness: 0.3,
            recency: 0.1,
        }
    }
}

/// Retrieval settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalSettings {
    /// Agent-local results (K₁)
    pub k_agent: usize,
    /// Tier-shared results (K₂)
    pub k_tier: usize,
    /// Collective results (K₃)
    pub k_collective: usize,
    /// LSH candidates below which the store is sampled instead
    pub min_candidates: usize,
    /// Size of the linear fallback sample
    pub fallback_sample: usize,
    /// Beam width of the graph search
    pub ef_search: usize,
    /// Score weights
    pub weights: ScoreWeights,
    /// Subtracted from the score of recently unhelpful experiences
    pub unhelpful_penalty: f32,
    /// Half-life of the recency term in days
    pub decay_half_life_days: f64,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            k_agent: 5,
            k_tier: 3,
            k_collective: 3,
            min_candidates: 8,
            fallback_sample: 128,
            ef_search: 64,
            weights: ScoreWeights::default(),
            unhelpful_penalty: 0.2,
            decay_half_life_days: crate::DECAY_HALF_LIFE_DAYS,
        }
    }
}

/// Control loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlLoopSettings {
    /// ACT timeout in milliseconds
    pub act_timeout_ms: u64,
    /// REFLECT timeout in milliseconds
    pub reflect_timeout_ms: u64,
    /// Max experiences in the THINK block
    pub max_augmentation_entries: usize,
    /// Max characters in the THINK block
    pub max_augmentation_chars: usize,
}

impl Default for ControlLoopSettings {
    fn default() -> Self {
        Self {
            act_timeout_ms: 30_000,
            reflect_timeout_ms: 10_000,
            max_augmentation_entries: 5,
            max_augmentation_chars: 2_000,
        }
    }
}
