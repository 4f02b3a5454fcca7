//! Visibility scope of an experience
//!
//! Scopes only ever widen: agent-local → tier-shared → collective.

use serde::{Deserialize, Serialize};

/// Who may consult an experience
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisibilityScope {
    /// Only the originating agent
    AgentLocal,
    /// Every agent in the originating tier
    TierShared,
    /// Every agent in every tier (breakthroughs)
    Collective,
}

impl VisibilityScope {
    /// Widen to `target`, never narrowing.
    pub fn widen(self, target: VisibilityScope) -> VisibilityScope {
        self.max(target)
    }

    /// Whether this scope is visible to the whole tier
    pub fn is_tier_visible(&self) -> bool {
        *self >= VisibilityScope::TierShared
    }
}

impl Default for VisibilityScope {
    fn default() -> Self {
        Self::AgentLocal
    }
}

impl std::fmt::Display for VisibilityScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VisibilityScope::AgentLocal => write!(f, "agent_local"),
            VisibilityScope::TierShared => write!(f, "tier_shared"),
            VisibilityScope::Collective => write!(f, "collective"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn any_scope() -> impl Strategy<Value = VisibilityScope> {
        prop_oneof![
            Just(VisibilityScope::AgentLocal),
            Just(VisibilityScope::TierShared),
            Just(VisibilityScope::Collective),
        ]
    }

    #[test]
    fn test_widen_is_monotone() {
        let scope = VisibilityScope::Collective;
        assert_eq!(scope.widen(VisibilityScope::AgentLocal), VisibilityScope::Collective);
        assert_eq!(
            VisibilityScope::AgentLocal.widen(VisibilityScope::TierShared),
            VisibilityScope::TierShared
        );
        assert!(VisibilityScope::TierShared.is_tier_visible());
        assert!(!VisibilityScope::AgentLocal.is_tier_visible());
    }

    proptest! {
        #[test]
        fn prop_widen_never_narrows(from in any_scope(), target in any_scope()) {
            let widened = from.widen(target);
            prop_assert!(widened >= from);
            prop_assert!(widened >= target);
            prop_assert_eq!(widened.widen(target), widened);
        }
    }
}
