//! Eviction queue
//!
//! Records kept in eviction order (fitness, then last access, then id), so
//! selecting victims walks from the cheap end instead of sorting the store.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use ordered_float::OrderedFloat;
use remem_common::ExperienceId;

use super::policy::EvictionCandidate;

type QueueKey = (OrderedFloat<f32>, DateTime<Utc>, ExperienceId);

fn key_of(candidate: &EvictionCandidate) -> QueueKey {
    (
        OrderedFloat(candidate.fitness),
        candidate.last_access_at,
        candidate.id,
    )
}

#[derive(Debug, Clone, Default)]
pub struct EvictionQueue {
    /// Eviction order → breakthrough stamp
    order: BTreeMap<QueueKey, Option<DateTime<Utc>>>,
    keys: HashMap<ExperienceId, QueueKey>,
}

impl EvictionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record, or move it after its fitness or access changed
    pub fn upsert(&mut self, candidate: EvictionCandidate) {
        let key = key_of(&candidate);
        if let Some(old) = self.keys.insert(candidate.id, key) {
            self.order.remove(&old);
        }
        self.order.insert(key, candidate.breakthrough_at);
    }

    pub fn remove(&mut self, id: &ExperienceId) -> bool {
        match self.keys.remove(id) {
            Some(key) => {
                self.order.remove(&key);
                true
            }
            None => false,
        }
    }

    /// Candidates, first to evict first
    pub fn iter(&self) -> impl Iterator<Item = EvictionCandidate> + '_ {
        self.order
            .iter()
            .map(|(&(fitness, last_access_at, id), &breakthrough_at)| EvictionCandidate {
                id,
                fitness: fitness.into_inner(),
                last_access_at,
                breakthrough_at,
            })
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn candidate(fitness: f32) -> EvictionCandidate {
        EvictionCandidate {
            id: ExperienceId::new(),
            fitness,
            last_access_at: Utc::now(),
            breakthrough_at: None,
        }
    }

    #[test]
    fn test_iterates_lowest_fitness_first() {
        let mut queue = EvictionQueue::new();
        for f in [0.6, 0.2, 0.9, 0.4] {
            queue.upsert(candidate(f));
        }
        let order: Vec<f32> = queue.iter().map(|c| c.fitness).collect();
        assert_eq!(order, vec![0.2, 0.4, 0.6, 0.9]);
    }

    #[test]
    fn test_upsert_repositions() {
        let mut queue = EvictionQueue::new();
        let mut low = candidate(0.1);
        queue.upsert(low);
        queue.upsert(candidate(0.5));

        low.fitness = 0.8;
        low.last_access_at = low.last_access_at + Duration::seconds(1);
        queue.upsert(low);

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.iter().last().map(|c| c.id), Some(low.id));
        assert_eq!(queue.iter().last().map(|c| c.fitness), Some(0.8));
    }

    #[test]
    fn test_remove() {
        let mut queue = EvictionQueue::new();
        let c = candidate(0.3);
        queue.upsert(c);
        assert!(queue.remove(&c.id));
        assert!(!queue.remove(&c.id));
        assert!(queue.is_empty());
        assert_eq!(queue.iter().count(), 0);
    }
}
