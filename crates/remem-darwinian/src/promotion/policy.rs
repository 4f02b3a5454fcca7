//! Promotion policy: fitness ≥ 0.7 → tier-shared, ≥ 0.9 → collective

use remem_common::VisibilityScope;

#[derive(Debug, Clone, Copy)]
pub struct PromotionPolicy {
    tier_share_threshold: f32,
    breakthrough_threshold: f32,
}

impl PromotionPolicy {
    pub fn new(tier_share_threshold: f32, breakthrough_threshold: f32) -> Self {
        Self {
            tier_share_threshold,
            breakthrough_threshold,
        }
    }

    /// Scope a score qualifies for on its own
    pub fn scope_for(&self, fitness: f32) -> VisibilityScope {
        if fitness >= self.breakthrough_threshold {
            VisibilityScope::Collective
        } else if fitness >= self.tier_share_threshold {
            VisibilityScope::TierShared
        } else {
            VisibilityScope::AgentLocal
        }
    }
}
