//! Identity handles
//!
//! Experiences are keyed by time-ordered UUIDs. Agents and tiers are resolved
//! by the surrounding server; the engine only carries their opaque names.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque handle of a stored experience
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExperienceId(Uuid);

impl ExperienceId {
    /// Generate a new time-ordered identifier
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Wrap an existing UUID
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// The underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Raw bytes, used as the key for hashed index structures
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for ExperienceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExperienceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

macro_rules! name_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(name: impl Into<String>) -> Self {
                Self(name.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(name: &str) -> Self {
                Self(name.to_string())
            }
        }

        impl From<String> for $name {
            fn from(name: String) -> Self {
                Self(name)
            }
        }
    };
}

name_handle!(
    /// Agent that produced an experience
    AgentId
);

name_handle!(
    /// Capability tier an agent belongs to
    TierId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_experience_ids_are_unique() {
        let a = ExperienceId::new();
        let b = ExperienceId::new();
        assert_ne!(a, b);
        assert_eq!(ExperienceId::from_uuid(*a.as_uuid()), a);
    }

    #[test]
    fn test_name_handles_serialize_transparently() {
        let agent = AgentId::from("coder");
        let json = serde_json::to_string(&agent).unwrap();
        assert_eq!(json, "\"coder\"");
        assert_eq!(TierId::new("t1").to_string(), "t1");
    }
}
