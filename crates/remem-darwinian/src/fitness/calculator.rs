//! Fitness calculation: η' = clamp(η + δ, 0, 1)

use remem_common::{MAX_FITNESS, MIN_FITNESS};
use serde::{Deserialize, Serialize};

/// Outcome reported by REFLECT for one request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    pub fn from_success(success: bool) -> Self {
        if success {
            Self::Success
        } else {
            Self::Failure
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FitnessCalculator {
    success_delta: f32,
    failure_delta: f32,
}

impl FitnessCalculator {
    /// Deltas are magnitudes; signs come from the outcome.
    pub fn new(success_delta: f32, failure_delta: f32) -> Self {
        Self {
            success_delta: success_delta.abs(),
            failure_delta: failure_delta.abs(),
        }
    }

    /// Signed adjustment for an outcome
    pub fn delta(&self, outcome: Outcome) -> f32 {
        match outcome {
            Outcome::Success => self.success_delta,
            Outcome::Failure => -self.failure_delta,
        }
    }

    /// Clamp into the fitness domain. NaN maps to the floor.
    pub fn clamp(score: f32) -> f32 {
        if score.is_nan() {
            return MIN_FITNESS;
        }
        score.clamp(MIN_FITNESS, MAX_FITNESS)
    }

    /// Apply an arbitrary delta to a score
    pub fn apply(current: f32, delta: f32) -> f32 {
        if !delta.is_finite() {
            return Self::clamp(current);
        }
        Self::clamp(current + delta)
    }

    /// Apply the outcome-driven delta
    pub fn adjust(&self, current: f32, outcome: Outcome) -> f32 {
        Self::apply(current, self.delta(outcome))
    }

    /// Starting fitness of a freshly evolved experience
    pub fn initial(quality: f64) -> f32 {
        Self::clamp(quality as f32)
    }
}
