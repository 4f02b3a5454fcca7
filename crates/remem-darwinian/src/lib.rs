//! # Darwinian
//!
//! Fitness evolution policy for ReMem experiences.
//!
//! ## Fitness Update
//!
//! ```text
//! η' = clamp(η + δ, 0, 1)
//! ```
//!
//! Where:
//! - η: Fitness score of a consulted experience
//! - δ: `+success_delta` on a successful outcome, `-failure_delta` on failure
//!
//! ## Promotion
//!
//! Experiences widen their visibility as fitness grows: tier-shared at 0.7,
//! collective (breakthrough) at 0.9. Scopes never narrow.
//!
//! ## Culling Policy
//!
//! Over capacity, the lowest-fitness records go first (oldest access breaks
//! ties). Breakthroughs are immune for a grace period.

pub mod culling;
pub mod fitness;
pub mod promotion;

use chrono::Duration;
use remem_common::{
    BREAKTHROUGH_THRESHOLD, DEFAULT_FAILURE_DELTA, DEFAULT_SUCCESS_DELTA, TIER_SHARE_THRESHOLD,
};
use serde::{Deserialize, Serialize};

pub use culling::policy::{CullingPolicy, EvictionCandidate, Shortfall};
pub use culling::queue::EvictionQueue;
pub use fitness::calculator::{FitnessCalculator, Outcome};
pub use promotion::policy::PromotionPolicy;

/// Darwinian configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DarwinianConfig {
    /// Fitness gained by each consulted experience on success
    pub success_delta: f32,
    /// Fitness lost by each consulted experience on failure
    pub failure_delta: f32,
    /// Fitness at which an experience becomes tier-shared
    pub tier_share_threshold: f32,
    /// Fitness at which an experience becomes a collective breakthrough
    pub breakthrough_threshold: f32,
    /// Days a breakthrough is exempt from eviction
    pub breakthrough_grace_days: i64,
}

impl Default for DarwinianConfig {
    fn default() -> Self {
        Self {
            success_delta: DEFAULT_SUCCESS_DELTA,
            failure_delta: DEFAULT_FAILURE_DELTA,
            tier_share_threshold: TIER_SHARE_THRESHOLD,
            breakthrough_threshold: BREAKTHROUGH_THRESHOLD,
            breakthrough_grace_days: 7,
        }
    }
}

impl DarwinianConfig {
    pub fn calculator(&self) -> FitnessCalculator {
        FitnessCalculator::new(self.success_delta, self.failure_delta)
    }

    pub fn promotion(&self) -> PromotionPolicy {
        PromotionPolicy::new(self.tier_share_threshold, self.breakthrough_threshold)
    }

    pub fn culling(&self) -> CullingPolicy {
        CullingPolicy::new(Duration::days(self.breakthrough_grace_days.max(0)))
    }
}
