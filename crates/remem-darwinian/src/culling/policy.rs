//! Culling policy: lowest fitness first, oldest access breaks ties,
//! breakthroughs immune during their grace period

use chrono::{DateTime, Duration, Utc};
use remem_common::{Experience, ExperienceId};
use thiserror::Error;
use tracing::debug;

use super::queue::EvictionQueue;

/// The fields eviction looks at
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvictionCandidate {
    pub id: ExperienceId,
    pub fitness: f32,
    pub last_access_at: DateTime<Utc>,
    pub breakthrough_at: Option<DateTime<Utc>>,
}

impl From<&Experience> for EvictionCandidate {
    fn from(e: &Experience) -> Self {
        Self {
            id: e.id,
            fitness: e.fitness_score,
            last_access_at: e.last_access_at,
            breakthrough_at: e.breakthrough_at,
        }
    }
}

/// Not enough unprotected records to free the requested space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("need {needed} evictions, only {evictable} evictable ({protected} protected)")]
pub struct Shortfall {
    pub needed: usize,
    pub evictable: usize,
    pub protected: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct CullingPolicy {
    grace: Duration,
}

impl CullingPolicy {
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }

    /// Whether a candidate is a breakthrough still inside its grace period
    pub fn is_protected(&self, candidate: &EvictionCandidate, now: DateTime<Utc>) -> bool {
        candidate
            .breakthrough_at
            .map(|at| now - at < self.grace)
            .unwrap_or(false)
    }

    /// Pick exactly `count` victims from the cheap end of `queue`, or report
    /// why that is impossible.
    ///
    /// Protected records are skipped. Nothing is selected on shortfall, so
    /// callers can reject the write before touching any state.
    pub fn select_victims(
        &self,
        queue: &EvictionQueue,
        count: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExperienceId>, Shortfall> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let mut victims = Vec::with_capacity(count);
        for candidate in queue.iter() {
            if self.is_protected(&candidate, now) {
                continue;
            }
            victims.push(candidate.id);
            if victims.len() == count {
                debug!(count, "Selected eviction victims");
                return Ok(victims);
            }
        }

        let protected = queue.iter().filter(|c| self.is_protected(c, now)).count();
        Err(Shortfall {
            needed: count,
            evictable: queue.len() - protected,
            protected,
        })
    }
}
