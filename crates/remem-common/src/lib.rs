//! # ReMem Common
//!
//! Shared types and errors for the ReMem experience engine.
//!
//! ## Core Types
//!
//! - [`Experience`]: a resolved task with its output, strategy, embedding and
//!   fitness metadata
//! - [`ExperienceId`], [`AgentId`], [`TierId`]: opaque identity handles
//! - [`VisibilityScope`]: agent-local → tier-shared → collective
//!
//! ## Errors
//!
//! - [`RememError`]: unified error type for every fallible engine operation
//! - [`ValidationError`]: malformed input rejected before it reaches the store

pub mod error;
pub mod types;

// Re-export commonly used types at crate root
pub use error::{RememError, Result, ValidationError};
pub use types::{
    experience::{normalize_task, Experience, ExperienceBuilder, TaskInput},
    ids::{AgentId, ExperienceId, TierId},
    scope::VisibilityScope,
};

/// ReMem version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Fitness at or above which an experience becomes a breakthrough
pub const BREAKTHROUGH_THRESHOLD: f32 = 0.9;

/// Fitness at or above which an experience is shared with its tier
pub const TIER_SHARE_THRESHOLD: f32 = 0.7;

/// Default fitness reward for experiences that contributed to a success
pub const DEFAULT_SUCCESS_DELTA: f32 = 0.05;

/// Default fitness penalty for experiences that contributed to a failure
pub const DEFAULT_FAILURE_DELTA: f32 = 0.02;

/// Minimum fitness score
pub const MIN_FITNESS: f32 = 0.0;

/// Maximum fitness score
pub const MAX_FITNESS: f32 = 1.0;

/// Schema name written in the snapshot header line
pub const SNAPSHOT_SCHEMA: &str = "remem.experience";

/// Snapshot format version
pub const SNAPSHOT_VERSION: u32 = 1;
