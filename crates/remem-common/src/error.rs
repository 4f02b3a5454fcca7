//! Error types for the ReMem engine
//!
//! Provides a unified error type and the validation sub-errors.

use thiserror::Error;

use crate::types::ids::ExperienceId;

/// Result type alias using RememError
pub type Result<T> = std::result::Result<T, RememError>;

/// Unified error type for ReMem operations
#[derive(Debug, Error)]
pub enum RememError {
    // Input validation errors (fatal to the calling operation)
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    // Lookup of an unknown or evicted experience
    #[error("Experience not found: {0}")]
    NotFound(ExperienceId),

    // Eviction cannot free space (fatal to the calling operation)
    #[error("Capacity exhausted: capacity {capacity}, {protected} records protected from eviction")]
    CapacityExhausted { capacity: usize, protected: usize },

    // Snapshot read/write errors
    #[error("Snapshot error: {0}")]
    Snapshot(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Timeout error
    #[error("Operation timed out: {0}")]
    Timeout(String),

    // Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RememError {
    /// Whether the error must abort the calling operation.
    ///
    /// Everything else is degraded or logged by the caller.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::CapacityExhausted { .. })
    }
}

/// Input validation errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Embedding contains non-finite values")]
    NonFiniteEmbedding,

    #[error("Task text is empty")]
    EmptyTask,

    #[error("Fitness score {0} outside [0, 1]")]
    FitnessOutOfRange(f32),

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Unsupported snapshot schema: {0}")]
    UnsupportedSchema(String),
}

// Implement From for common external error types
impl From<serde_json::Error> for RememError {
    fn from(err: serde_json::Error) -> Self {
        RememError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for RememError {
    fn from(err: std::io::Error) -> Self {
        RememError::Snapshot(err.to_string())
    }
}

impl From<anyhow::Error> for RememError {
    fn from(err: anyhow::Error) -> Self {
        RememError::Internal(err.to_string())
    }
}
